//! Engine construction and lifecycle.
//!
//! # Data Flow
//! ```text
//! Options
//!     → log level check
//!     → outbound.rs (build, resolve detours and groups)
//!     → inbound.rs (build, bind sockets)
//!     → dns.rs (servers, rules, final)
//!     → routing (route rules, final)
//!     → ntp.rs (optional timer)
//!     → spawn accept loops and timers
//!     → Engine (live until close)
//! ```
//!
//! # Design Decisions
//! - First failure wins; the partially built engine is closed before the
//!   error is returned so no socket outlives a failed construction
//! - Every background task subscribes to the engine's shutdown broadcast
//!   and watches the construction context
//! - `close` never fails and may be called any number of times

pub mod dispatch;
pub mod dns;
pub mod error;
pub mod inbound;
pub mod ntp;
pub mod outbound;

pub use error::{BuildError, EngineError};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::{LogOptions, Options};
use crate::lifecycle::{Context, Shutdown};
use crate::net::ConnectionTracker;
use crate::observability::logging::level_filter;
use crate::routing::{Router, TagScope};

use self::dispatch::Dispatcher;
use self::dns::DnsRouter;
use self::inbound::{BoundInbound, Inbound, ServeContext};
use self::ntp::NtpService;
use self::outbound::OutboundManager;

/// How long `close` waits for open connections to finish.
pub const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A constructed engine holding live listeners and timers.
#[derive(Debug)]
pub struct Engine {
    ctx: Context,
    shutdown: Arc<Shutdown>,
    tracker: ConnectionTracker,
    tasks: Vec<JoinHandle<()>>,
    /// Bound sockets whose tasks are not spawned yet.
    pending: Vec<BoundInbound>,
    inbound_addrs: Vec<(String, SocketAddr)>,
    dispatcher: Option<Arc<Dispatcher>>,
    closed: bool,
}

impl Engine {
    /// Build every table from `options` and start the background tasks.
    ///
    /// Returns [`EngineError::Cancelled`] if `ctx` is cancelled while building.
    pub async fn new(ctx: Context, options: Options) -> Result<Self, EngineError> {
        let mut engine = Self {
            ctx,
            shutdown: Arc::new(Shutdown::new()),
            tracker: ConnectionTracker::new(),
            tasks: Vec::new(),
            pending: Vec::new(),
            inbound_addrs: Vec::new(),
            dispatcher: None,
            closed: false,
        };

        match engine.start(&options).await {
            Ok(()) => Ok(engine),
            Err(e) => {
                engine.close().await;
                Err(e)
            }
        }
    }

    async fn start(&mut self, options: &Options) -> Result<(), EngineError> {
        self.ensure_active()?;
        validate_log(&options.log)?;

        let outbounds = OutboundManager::build(&options.outbounds)?;

        let mut inbound_tags = HashSet::new();
        for (index, opts) in options.inbounds.iter().enumerate() {
            let inbound = Inbound::build(index, opts).map_err(|source| EngineError::Inbound { index, source })?;
            if !inbound_tags.insert(inbound.tag.clone()) {
                return Err(EngineError::Inbound {
                    index,
                    source: BuildError::DuplicateTag(inbound.tag),
                });
            }
            self.ensure_active()?;
            let bound = BoundInbound::bind(inbound)
                .await
                .map_err(|source| EngineError::Inbound { index, source })?;
            if let Some(addr) = bound.local_addr() {
                self.inbound_addrs.push((bound.inbound.tag.clone(), addr));
            }
            self.pending.push(bound);
        }

        let outbound_tags = outbounds.tags();
        let dns = DnsRouter::build(&options.dns, &inbound_tags, &outbound_tags)?;
        let dns_tags = dns.tags();
        let scope = TagScope {
            inbounds: &inbound_tags,
            outbounds: &outbound_tags,
            dns_servers: &dns_tags,
        };
        let router = Router::build(&options.route, scope, outbounds.default_tag())?;
        let ntp = NtpService::build(&options.ntp, &outbound_tags).map_err(EngineError::Ntp)?;
        self.ensure_active()?;

        let dispatcher = Arc::new(Dispatcher::new(router, outbounds, dns));
        self.spawn_inbounds(Arc::clone(&dispatcher));
        if let Some(ntp) = ntp {
            let shutdown_rx = self.shutdown.subscribe();
            self.tasks.push(tokio::spawn(ntp.run(self.ctx.clone(), shutdown_rx)));
        }
        self.dispatcher = Some(dispatcher);

        tracing::debug!(
            inbounds = inbound_tags.len(),
            outbounds = outbound_tags.len(),
            dns_servers = dns_tags.len(),
            "Engine started"
        );
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        if self.ctx.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn spawn_inbounds(&mut self, dispatcher: Arc<Dispatcher>) {
        let serve_ctx = ServeContext {
            ctx: self.ctx.clone(),
            shutdown: Arc::clone(&self.shutdown),
            tracker: self.tracker.clone(),
            dispatcher,
        };
        for bound in self.pending.drain(..) {
            if let Some(listener) = bound.tcp {
                let shutdown_rx = self.shutdown.subscribe();
                self.tasks.push(tokio::spawn(inbound::serve(
                    Arc::clone(&bound.inbound),
                    listener,
                    serve_ctx.clone(),
                    shutdown_rx,
                )));
            }
            if let Some(socket) = bound.udp {
                let shutdown_rx = self.shutdown.subscribe();
                self.tasks.push(tokio::spawn(inbound::hold_udp(
                    bound.inbound.tag.clone(),
                    socket,
                    self.ctx.clone(),
                    shutdown_rx,
                )));
            }
        }
    }

    /// Stop every task, wait for them, then give connections time to drain.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown.trigger();
        self.pending.clear();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Engine task failed");
            }
        }

        if !self.tracker.wait_for_drain(CLOSE_DRAIN_TIMEOUT).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Connections still open after drain timeout"
            );
        }
        tracing::debug!("Engine closed");
    }

    /// Local addresses of the bound TCP listeners, by inbound tag.
    pub fn inbound_addrs(&self) -> &[(String, SocketAddr)] {
        &self.inbound_addrs
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn dispatcher(&self) -> Option<&Dispatcher> {
        self.dispatcher.as_deref()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.closed {
            self.shutdown.trigger();
        }
    }
}

fn validate_log(options: &LogOptions) -> Result<(), EngineError> {
    match level_filter(&options.level) {
        Some(_) => Ok(()),
        None => Err(EngineError::Log(BuildError::invalid("level", options.level.clone()))),
    }
}

/// A live engine that can be released.
#[async_trait]
pub trait Instance: Send {
    /// Release every resource. Never fails; safe to call twice.
    async fn close(&mut self);
}

/// Builds engine instances from parsed options.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    type Instance: Instance;

    async fn build(&self, ctx: Context, options: Options) -> Result<Self::Instance, EngineError>;
}

#[async_trait]
impl Instance for Engine {
    async fn close(&mut self) {
        Engine::close(self).await;
    }
}

/// Factory for the real [`Engine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineBuilder;

#[async_trait]
impl EngineFactory for EngineBuilder {
    type Instance = Engine;

    async fn build(&self, ctx: Context, options: Options) -> Result<Engine, EngineError> {
        Engine::new(ctx, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InboundOptions, RouteOptions, RuleOptions, Listable};

    fn mixed(tag: &str, port: u16) -> InboundOptions {
        InboundOptions {
            kind: "mixed".into(),
            tag: tag.into(),
            listen: "127.0.0.1".into(),
            listen_port: port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_options_build_and_close() {
        let mut engine = Engine::new(Context::new(), Options::default()).await.unwrap();
        let dispatcher = engine.dispatcher().unwrap();
        assert_eq!(dispatcher.outbounds().default_tag(), "direct");
        assert_eq!(dispatcher.router().final_outbound(), "direct");

        engine.close().await;
        assert!(engine.is_closed());
        engine.close().await;
    }

    #[tokio::test]
    async fn invalid_log_level_fails_first() {
        let mut options = Options::default();
        options.log.level = "verbose".into();
        options.inbounds.push(InboundOptions {
            kind: "bogus".into(),
            ..Default::default()
        });
        let err = Engine::new(Context::new(), options).await.unwrap_err();
        assert_eq!(err.to_string(), "parse log options: invalid level: verbose");
    }

    #[tokio::test]
    async fn cancelled_context_aborts_construction() {
        let ctx = Context::new();
        ctx.cancel();
        let err = Engine::new(ctx, Options::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn duplicate_inbound_tag_releases_first_listener() {
        let mut options = Options::default();
        options.inbounds = vec![mixed("mixed-in", 0), mixed("mixed-in", 0)];
        let err = Engine::new(Context::new(), options).await.unwrap_err();
        assert_eq!(err.to_string(), "initialize inbound[1]: duplicate tag: mixed-in");
    }

    #[tokio::test]
    async fn route_failure_frees_bound_port() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut options = Options::default();
        options.inbounds = vec![mixed("mixed-in", port)];
        options.route = RouteOptions {
            rules: vec![RuleOptions {
                domain: Listable(vec!["example.com".into()]),
                outbound: "proxy".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = Engine::new(Context::new(), options).await.unwrap_err();
        assert_eq!(err.to_string(), "parse route rule[0]: outbound not found: proxy");

        std::net::TcpListener::bind(("127.0.0.1", port)).expect("port must be released");
    }

    #[tokio::test]
    async fn accept_loop_stops_when_context_is_cancelled() {
        let ctx = Context::new();
        let mut options = Options::default();
        options.inbounds = vec![mixed("mixed-in", 0)];
        let mut engine = Engine::new(ctx.clone(), options).await.unwrap();
        let (_, addr) = engine.inbound_addrs()[0].clone();

        ctx.cancel();
        let tasks: Vec<_> = engine.tasks.drain(..).collect();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        }
        std::net::TcpListener::bind(addr).expect("listener must be dropped");
        engine.close().await;
    }
}
