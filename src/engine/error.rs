//! Engine construction errors.

use thiserror::Error;

use crate::net::ListenerError;

/// Why a single inbound, outbound, DNS server or rule could not be built.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown {kind} type: {name}")]
    UnknownType { kind: &'static str, name: String },

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },

    #[error("duplicate tag: {0}")]
    DuplicateTag(String),

    #[error("outbound not found: {0}")]
    OutboundNotFound(String),

    #[error("inbound not found: {0}")]
    InboundNotFound(String),

    #[error("dns server not found: {0}")]
    DnsServerNotFound(String),

    #[error("detour to itself: {0}")]
    SelfDetour(String),

    #[error("detour loop: {0}")]
    DetourLoop(String),

    #[error("{0}")]
    Listen(#[from] ListenerError),
}

impl BuildError {
    pub(crate) fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            value: value.into(),
        }
    }
}

/// Error returned by [`Engine::new`](crate::engine::Engine::new).
///
/// Each variant names the table and position of the failing entry.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse log options: {0}")]
    Log(#[source] BuildError),

    #[error("initialize outbound[{index}]: {source}")]
    Outbound {
        index: usize,
        #[source]
        source: BuildError,
    },

    #[error("initialize inbound[{index}]: {source}")]
    Inbound {
        index: usize,
        #[source]
        source: BuildError,
    },

    #[error("parse dns server[{index}]: {source}")]
    DnsServer {
        index: usize,
        #[source]
        source: BuildError,
    },

    #[error("parse dns rule[{index}]: {source}")]
    DnsRule {
        index: usize,
        #[source]
        source: BuildError,
    },

    #[error("parse dns options: {0}")]
    Dns(#[source] BuildError),

    #[error("parse route rule[{index}]: {source}")]
    RouteRule {
        index: usize,
        #[source]
        source: BuildError,
    },

    #[error("parse route options: {0}")]
    Route(#[source] BuildError),

    #[error("initialize ntp service: {0}")]
    Ntp(#[source] BuildError),

    #[error("engine construction cancelled")]
    Cancelled,
}
