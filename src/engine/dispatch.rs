//! Connection dispatch: route an accepted connection and relay it.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::engine::dns::DnsRouter;
use crate::engine::inbound::{Inbound, InboundKind};
use crate::engine::outbound::OutboundManager;
use crate::net;
use crate::routing::{Decision, Metadata, Router};

/// Routes connections accepted by the engine's inbounds.
#[derive(Debug)]
pub struct Dispatcher {
    router: Router,
    outbounds: OutboundManager,
    dns: DnsRouter,
}

impl Dispatcher {
    pub fn new(router: Router, outbounds: OutboundManager, dns: DnsRouter) -> Self {
        Self {
            router,
            outbounds,
            dns,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn outbounds(&self) -> &OutboundManager {
        &self.outbounds
    }

    /// Tag of the DNS server a hijacked query from `meta` would go to.
    fn dns_server(&self, meta: &Metadata) -> Option<&str> {
        self.dns.select(meta).map(|server| server.tag.as_str())
    }

    /// Handle one accepted connection until either side closes.
    pub async fn handle(&self, inbound: &Inbound, mut stream: TcpStream, peer: SocketAddr) {
        let (host, port) = match &inbound.kind {
            InboundKind::Direct {
                destination: Some((host, port)),
            } => (host.clone(), *port),
            InboundKind::Direct { destination: None } => {
                tracing::debug!(tag = %inbound.tag, peer = %peer, "No destination for direct inbound, closing");
                return;
            }
            other => {
                tracing::debug!(
                    tag = %inbound.tag,
                    kind = other.type_name(),
                    peer = %peer,
                    "Inbound protocol is not available in this build, closing"
                );
                return;
            }
        };

        let meta = Metadata::tcp(inbound.tag.clone(), peer, host, port);
        let tag = match self.router.route(&meta) {
            Decision::Outbound(tag) => tag,
            Decision::Reject => {
                tracing::debug!(inbound = %meta.inbound, destination = %meta.destination, "Connection rejected");
                return;
            }
            Decision::HijackDns => {
                tracing::debug!(
                    inbound = %meta.inbound,
                    server = ?self.dns_server(&meta),
                    "DNS hijacked, no DNS listener in this build, closing"
                );
                return;
            }
        };

        let mut upstream = match self.outbounds.dial(tag, &meta.destination, meta.port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(
                    outbound = %tag,
                    destination = %meta.destination,
                    port = meta.port,
                    error = %e,
                    "Dial failed"
                );
                return;
            }
        };

        tracing::info!(
            inbound = %meta.inbound,
            outbound = %tag,
            destination = %meta.destination,
            port = meta.port,
            "Connection established"
        );
        match net::relay(&mut stream, &mut upstream).await {
            Ok((up, down)) => tracing::debug!(up, down, "Connection finished"),
            Err(e) => tracing::debug!(error = %e, "Connection aborted"),
        }
    }
}
