//! Inbound table.
//!
//! # Responsibilities
//! - Validate each inbound's options
//! - Bind listening sockets during construction
//! - Run accept loops that hand connections to the dispatcher
//!
//! # Design Decisions
//! - Binding happens before the route table is built so address conflicts
//!   surface at construction time
//! - Sockets stay owned by the engine until their accept loop takes them,
//!   so a failed construction drops them with the engine

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::config::InboundOptions;
use crate::engine::dispatch::Dispatcher;
use crate::engine::BuildError;
use crate::lifecycle::{Context, Shutdown};
use crate::net::{ConnectionTracker, IpCidr, Listener, DEFAULT_MAX_CONNECTIONS};
use crate::routing::rule::parse_network;
use crate::routing::{Host, Network};

const TUN_STACKS: &[&str] = &["", "system", "gvisor", "mixed"];

/// Protocol specific part of an inbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Mixed,
    Socks,
    Http,
    /// Forwards every connection to a fixed destination when one is set.
    Direct { destination: Option<(Host, u16)> },
    Tun,
}

impl InboundKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundKind::Mixed => "mixed",
            InboundKind::Socks => "socks",
            InboundKind::Http => "http",
            InboundKind::Direct { .. } => "direct",
            InboundKind::Tun => "tun",
        }
    }
}

/// A validated inbound, not yet bound.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub tag: String,
    pub kind: InboundKind,
    /// Socket address to bind; `None` for inbounds without a listener.
    pub listen: Option<SocketAddr>,
    /// `None` means both networks.
    pub network: Option<Network>,
}

impl Inbound {
    /// Validate options. An empty tag is replaced by the entry's index.
    pub fn build(index: usize, options: &InboundOptions) -> Result<Self, BuildError> {
        let tag = if options.tag.is_empty() {
            index.to_string()
        } else {
            options.tag.clone()
        };

        let network = if options.network.is_empty() {
            None
        } else {
            Some(parse_network(&options.network)?)
        };

        let kind = match options.kind.as_str() {
            "mixed" => InboundKind::Mixed,
            "socks" => InboundKind::Socks,
            "http" => InboundKind::Http,
            "direct" => {
                let destination = if options.override_address.is_empty() {
                    None
                } else {
                    if options.override_port == 0 {
                        return Err(BuildError::Missing("override_port"));
                    }
                    let host = match options.override_address.parse::<IpAddr>() {
                        Ok(ip) => Host::Ip(ip),
                        Err(_) => Host::Domain(options.override_address.clone()),
                    };
                    Some((host, options.override_port))
                };
                InboundKind::Direct { destination }
            }
            "tun" => {
                validate_tun(options)?;
                InboundKind::Tun
            }
            "" => return Err(BuildError::Missing("type")),
            other => {
                return Err(BuildError::UnknownType {
                    kind: "inbound",
                    name: other.to_string(),
                })
            }
        };

        let listen = match kind {
            InboundKind::Tun => None,
            _ => Some(parse_listen(options)?),
        };

        for user in &options.users {
            if user.username.is_empty() {
                return Err(BuildError::Missing("users.username"));
            }
        }

        Ok(Self {
            tag,
            kind,
            listen,
            network,
        })
    }

    fn binds_tcp(&self) -> bool {
        self.network != Some(Network::Udp)
    }

    /// Only `direct` inbounds carry UDP in this build.
    fn binds_udp(&self) -> bool {
        matches!(self.kind, InboundKind::Direct { .. }) && self.network == Some(Network::Udp)
    }
}

fn parse_listen(options: &InboundOptions) -> Result<SocketAddr, BuildError> {
    let ip = if options.listen.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        options
            .listen
            .parse()
            .map_err(|_| BuildError::invalid("listen", options.listen.clone()))?
    };
    Ok(SocketAddr::new(ip, options.listen_port))
}

fn validate_tun(options: &InboundOptions) -> Result<(), BuildError> {
    for address in options.address.iter() {
        address
            .parse::<IpCidr>()
            .map_err(|_| BuildError::invalid("address", address.clone()))?;
    }
    if let Some(mtu) = options.mtu {
        if !(576..=65535).contains(&mtu) {
            return Err(BuildError::invalid("mtu", mtu.to_string()));
        }
    }
    if !TUN_STACKS.contains(&options.stack.as_str()) {
        return Err(BuildError::invalid("stack", options.stack.clone()));
    }
    Ok(())
}

/// An inbound whose sockets are bound.
#[derive(Debug)]
pub struct BoundInbound {
    pub inbound: Arc<Inbound>,
    pub tcp: Option<Listener>,
    pub udp: Option<UdpSocket>,
}

impl BoundInbound {
    /// Bind the sockets of `inbound`.
    pub async fn bind(inbound: Inbound) -> Result<Self, BuildError> {
        let mut tcp = None;
        let mut udp = None;
        if let Some(addr) = inbound.listen {
            if inbound.binds_tcp() {
                tcp = Some(Listener::bind(addr, DEFAULT_MAX_CONNECTIONS).await?);
            }
            if inbound.binds_udp() {
                let socket = UdpSocket::bind(addr).await.map_err(|e| {
                    BuildError::Listen(crate::net::ListenerError::Bind(addr, e))
                })?;
                udp = Some(socket);
            }
        }
        tracing::debug!(
            tag = %inbound.tag,
            kind = inbound.kind.type_name(),
            listen = ?tcp.as_ref().and_then(|l| l.local_addr().ok()),
            "Inbound started"
        );
        Ok(Self {
            inbound: Arc::new(inbound),
            tcp,
            udp,
        })
    }

    /// Local address of the TCP listener, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }
}

/// Everything an accept loop needs besides its listener.
#[derive(Clone)]
pub struct ServeContext {
    pub ctx: Context,
    pub shutdown: Arc<Shutdown>,
    pub tracker: ConnectionTracker,
    pub dispatcher: Arc<Dispatcher>,
}

/// Accept connections until the context is cancelled or the engine closes.
pub async fn serve(
    inbound: Arc<Inbound>,
    listener: Listener,
    serve_ctx: ServeContext,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = serve_ctx.ctx.cancelled() => break,
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    let mut conn_shutdown = serve_ctx.shutdown.subscribe();
                    if serve_ctx.shutdown.is_triggered() {
                        break;
                    }
                    let guard = serve_ctx.tracker.track();
                    tracing::trace!(tag = %inbound.tag, conn = %guard.id(), peer = %peer, "Connection accepted");
                    let inbound = Arc::clone(&inbound);
                    let ctx = serve_ctx.ctx.clone();
                    let dispatcher = Arc::clone(&serve_ctx.dispatcher);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _guard = guard;
                        tokio::select! {
                            _ = dispatcher.handle(&inbound, stream, peer) => {}
                            _ = ctx.cancelled() => {}
                            _ = conn_shutdown.recv() => {}
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(tag = %inbound.tag, error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
        }
    }
    tracing::debug!(tag = %inbound.tag, "Inbound closed");
}

/// Hold a UDP socket until the context is cancelled or the engine closes.
pub async fn hold_udp(
    tag: String,
    socket: UdpSocket,
    ctx: Context,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = ctx.cancelled() => {}
        _ = shutdown_rx.recv() => {}
    }
    drop(socket);
    tracing::debug!(tag = %tag, "UDP socket closed");
}
