//! Outbound table.
//!
//! # Responsibilities
//! - Build each outbound from its options, checking protocol fields
//! - Enforce unique tags
//! - Resolve detours and group members, rejecting loops
//! - Dial destinations through the outbounds this build can drive

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::OutboundOptions;
use crate::engine::{BuildError, EngineError};
use crate::routing::Host;

/// Shadowsocks ciphers accepted in `method`.
const SHADOWSOCKS_METHODS: &[&str] = &[
    "none",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
];

const VLESS_FLOWS: &[&str] = &["", "xtls-rprx-vision"];

const DEFAULT_URLTEST_URL: &str = "https://www.gstatic.com/generate_204";

const DEFAULT_URLTEST_INTERVAL: Duration = Duration::from_secs(180);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol specific part of an outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundKind {
    Direct,
    Block,
    Dns,
    Socks,
    Http,
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
    Selector { members: Vec<String>, default: String },
    UrlTest { members: Vec<String>, url: url::Url, interval: Duration },
}

impl OutboundKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundKind::Direct => "direct",
            OutboundKind::Block => "block",
            OutboundKind::Dns => "dns",
            OutboundKind::Socks => "socks",
            OutboundKind::Http => "http",
            OutboundKind::Shadowsocks => "shadowsocks",
            OutboundKind::Vmess => "vmess",
            OutboundKind::Vless => "vless",
            OutboundKind::Trojan => "trojan",
            OutboundKind::Selector { .. } => "selector",
            OutboundKind::UrlTest { .. } => "urltest",
        }
    }

    fn members(&self) -> &[String] {
        match self {
            OutboundKind::Selector { members, .. } | OutboundKind::UrlTest { members, .. } => members,
            _ => &[],
        }
    }
}

/// A built outbound.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub tag: String,
    pub kind: OutboundKind,
    /// Upstream server for wrapped protocols.
    pub server: Option<(String, u16)>,
    pub detour: Option<String>,
}

impl Outbound {
    /// Build an outbound from its options.
    ///
    /// An empty tag is replaced by the entry's index.
    pub fn build(index: usize, options: &OutboundOptions) -> Result<Self, BuildError> {
        let tag = if options.tag.is_empty() {
            index.to_string()
        } else {
            options.tag.clone()
        };

        let kind = match options.kind.as_str() {
            "direct" => OutboundKind::Direct,
            "block" => OutboundKind::Block,
            "dns" => OutboundKind::Dns,
            "socks" => OutboundKind::Socks,
            "http" => OutboundKind::Http,
            "shadowsocks" => {
                if options.method.is_empty() {
                    return Err(BuildError::Missing("method"));
                }
                if !SHADOWSOCKS_METHODS.contains(&options.method.as_str()) {
                    return Err(BuildError::invalid("method", options.method.clone()));
                }
                if options.method != "none" && options.password.is_empty() {
                    return Err(BuildError::Missing("password"));
                }
                OutboundKind::Shadowsocks
            }
            "vmess" | "vless" => {
                if options.uuid.is_empty() {
                    return Err(BuildError::Missing("uuid"));
                }
                uuid::Uuid::parse_str(&options.uuid)
                    .map_err(|_| BuildError::invalid("uuid", options.uuid.clone()))?;
                if options.kind == "vless" {
                    if !VLESS_FLOWS.contains(&options.flow.as_str()) {
                        return Err(BuildError::invalid("flow", options.flow.clone()));
                    }
                    OutboundKind::Vless
                } else {
                    OutboundKind::Vmess
                }
            }
            "trojan" => {
                if options.password.is_empty() {
                    return Err(BuildError::Missing("password"));
                }
                OutboundKind::Trojan
            }
            "selector" => {
                if options.outbounds.is_empty() {
                    return Err(BuildError::Missing("outbounds"));
                }
                let default = if options.default.is_empty() {
                    options.outbounds[0].clone()
                } else if options.outbounds.contains(&options.default) {
                    options.default.clone()
                } else {
                    return Err(BuildError::invalid("default", options.default.clone()));
                };
                OutboundKind::Selector {
                    members: options.outbounds.clone(),
                    default,
                }
            }
            "urltest" => {
                if options.outbounds.is_empty() {
                    return Err(BuildError::Missing("outbounds"));
                }
                let raw_url = if options.url.is_empty() {
                    DEFAULT_URLTEST_URL
                } else {
                    options.url.as_str()
                };
                let url = url::Url::parse(raw_url)
                    .ok()
                    .filter(|u| u.scheme() == "http" || u.scheme() == "https")
                    .ok_or_else(|| BuildError::invalid("url", raw_url))?;
                let interval = options
                    .interval
                    .parse_or(DEFAULT_URLTEST_INTERVAL)
                    .map_err(|e| BuildError::invalid("interval", e.0))?;
                OutboundKind::UrlTest {
                    members: options.outbounds.clone(),
                    url,
                    interval,
                }
            }
            "" => return Err(BuildError::Missing("type")),
            other => {
                return Err(BuildError::UnknownType {
                    kind: "outbound",
                    name: other.to_string(),
                })
            }
        };

        let needs_server = matches!(
            kind,
            OutboundKind::Socks
                | OutboundKind::Http
                | OutboundKind::Shadowsocks
                | OutboundKind::Vmess
                | OutboundKind::Vless
                | OutboundKind::Trojan
        );
        let server = if needs_server {
            if options.server.is_empty() {
                return Err(BuildError::Missing("server"));
            }
            if options.server_port == 0 {
                return Err(BuildError::Missing("server_port"));
            }
            Some((options.server.clone(), options.server_port))
        } else {
            None
        };

        if !options.network.is_empty() {
            crate::routing::rule::parse_network(&options.network)?;
        }
        if !options.domain_strategy.is_empty() {
            crate::routing::rule::validate_strategy(&options.domain_strategy)
                .map_err(|_| BuildError::invalid("domain_strategy", options.domain_strategy.clone()))?;
        }

        let detour = (!options.detour.is_empty()).then(|| options.detour.clone());
        Ok(Self {
            tag,
            kind,
            server,
            detour,
        })
    }
}

/// All outbounds of an engine, indexed by tag.
#[derive(Debug)]
pub struct OutboundManager {
    outbounds: Vec<Outbound>,
    index: HashMap<String, usize>,
}

impl OutboundManager {
    /// Build the table.
    ///
    /// An empty list yields a single `direct` outbound tagged `direct`.
    pub fn build(options: &[OutboundOptions]) -> Result<Self, EngineError> {
        let mut outbounds = Vec::with_capacity(options.len().max(1));
        let mut index = HashMap::new();

        for (i, opts) in options.iter().enumerate() {
            let outbound = Outbound::build(i, opts).map_err(|source| EngineError::Outbound { index: i, source })?;
            if index.insert(outbound.tag.clone(), i).is_some() {
                return Err(EngineError::Outbound {
                    index: i,
                    source: BuildError::DuplicateTag(outbound.tag),
                });
            }
            tracing::trace!(tag = %outbound.tag, kind = outbound.kind.type_name(), "Outbound built");
            outbounds.push(outbound);
        }

        if outbounds.is_empty() {
            index.insert("direct".to_string(), 0);
            outbounds.push(Outbound {
                tag: "direct".to_string(),
                kind: OutboundKind::Direct,
                server: None,
                detour: None,
            });
        }

        let manager = Self { outbounds, index };
        manager.resolve_references()?;
        Ok(manager)
    }

    fn resolve_references(&self) -> Result<(), EngineError> {
        for (i, outbound) in self.outbounds.iter().enumerate() {
            let fail = |source| EngineError::Outbound { index: i, source };
            let targets = outbound.detour.iter().chain(outbound.kind.members());
            for target in targets {
                if *target == outbound.tag {
                    return Err(fail(BuildError::SelfDetour(target.clone())));
                }
                if !self.index.contains_key(target) {
                    return Err(fail(BuildError::OutboundNotFound(target.clone())));
                }
            }
        }

        // Depth-first search over detour and member edges.
        let mut finished = HashSet::new();
        for start in 0..self.outbounds.len() {
            let mut on_path = HashSet::new();
            if let Some(tag) = self.find_loop(start, &mut on_path, &mut finished) {
                return Err(EngineError::Outbound {
                    index: start,
                    source: BuildError::DetourLoop(tag),
                });
            }
        }
        Ok(())
    }

    fn find_loop(
        &self,
        node: usize,
        on_path: &mut HashSet<usize>,
        finished: &mut HashSet<usize>,
    ) -> Option<String> {
        if finished.contains(&node) {
            return None;
        }
        if !on_path.insert(node) {
            return Some(self.outbounds[node].tag.clone());
        }
        let outbound = &self.outbounds[node];
        for target in outbound.detour.iter().chain(outbound.kind.members()) {
            if let Some(&next) = self.index.get(target) {
                if let Some(tag) = self.find_loop(next, on_path, finished) {
                    return Some(tag);
                }
            }
        }
        on_path.remove(&node);
        finished.insert(node);
        None
    }

    pub fn get(&self, tag: &str) -> Option<&Outbound> {
        self.index.get(tag).map(|&i| &self.outbounds[i])
    }

    /// Tag of the first outbound, used when the route table has no final.
    pub fn default_tag(&self) -> &str {
        &self.outbounds[0].tag
    }

    pub fn tags(&self) -> HashSet<String> {
        self.index.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.outbounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbounds.is_empty()
    }

    /// Follow group selections down to a concrete outbound.
    pub fn resolve(&self, tag: &str) -> Option<&Outbound> {
        let mut current = self.get(tag)?;
        // Construction rejected member loops, so this terminates.
        loop {
            let next = match &current.kind {
                OutboundKind::Selector { default, .. } => default.as_str(),
                OutboundKind::UrlTest { members, .. } => members[0].as_str(),
                _ => return Some(current),
            };
            current = self.get(next)?;
        }
    }

    /// Open a TCP connection to `host:port` through the outbound `tag`.
    pub async fn dial(&self, tag: &str, host: &Host, port: u16) -> io::Result<TcpStream> {
        let outbound = self
            .resolve(tag)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("outbound not found: {}", tag)))?;

        match outbound.kind {
            OutboundKind::Direct => {
                let connect = async {
                    match host {
                        Host::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, port)).await,
                        Host::Domain(domain) => TcpStream::connect((domain.as_str(), port)).await,
                    }
                };
                tokio::time::timeout(CONNECT_TIMEOUT, connect)
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))?
            }
            OutboundKind::Block => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("blocked by outbound {}", outbound.tag),
            )),
            ref other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} outbound is not available in this build", other.type_name()),
            )),
        }
    }
}
