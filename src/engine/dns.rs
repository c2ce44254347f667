//! DNS server and rule table.
//!
//! # Responsibilities
//! - Validate server definitions and default ports
//! - Resolve detour (outbound) and domain resolver (server) references
//! - Compile DNS rules and pick the server for a query

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::config::{DnsOptions, DnsServerOptions};
use crate::engine::{BuildError, EngineError};
use crate::net::IpCidr;
use crate::routing::rule::{compile_rule, validate_strategy, Rule, RuleAction, RuleTable, TagScope};
use crate::routing::Metadata;

/// Kind of DNS transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsServerKind {
    Local,
    Hosts,
    Dhcp,
    Tcp,
    Udp,
    Tls,
    Https,
    H3,
    Quic,
    FakeIp,
}

impl DnsServerKind {
    fn parse(name: &str) -> Result<Self, BuildError> {
        Ok(match name {
            "local" => Self::Local,
            "hosts" => Self::Hosts,
            "dhcp" => Self::Dhcp,
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "tls" => Self::Tls,
            "https" => Self::Https,
            "h3" => Self::H3,
            "quic" => Self::Quic,
            "fakeip" => Self::FakeIp,
            "" => return Err(BuildError::Missing("type")),
            other => {
                return Err(BuildError::UnknownType {
                    kind: "dns server",
                    name: other.to_string(),
                })
            }
        })
    }

    /// Port used when `server_port` is unset. `None` for kinds without a server.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Tcp | Self::Udp => Some(53),
            Self::Tls | Self::Quic => Some(853),
            Self::Https | Self::H3 => Some(443),
            Self::Local | Self::Hosts | Self::Dhcp | Self::FakeIp => None,
        }
    }
}

/// A validated DNS server.
#[derive(Debug, Clone)]
pub struct DnsServer {
    pub tag: String,
    pub kind: DnsServerKind,
    pub address: Option<(String, u16)>,
    pub detour: Option<String>,
    pub domain_resolver: Option<String>,
    pub fake_ranges: Vec<IpCidr>,
}

impl DnsServer {
    pub fn build(index: usize, options: &DnsServerOptions) -> Result<Self, BuildError> {
        let kind = DnsServerKind::parse(&options.kind)?;
        let tag = if options.tag.is_empty() {
            index.to_string()
        } else {
            options.tag.clone()
        };

        let address = match kind.default_port() {
            Some(default_port) => {
                if options.server.is_empty() {
                    return Err(BuildError::Missing("server"));
                }
                validate_host(&options.server)?;
                let port = if options.server_port == 0 {
                    default_port
                } else {
                    options.server_port
                };
                Some((options.server.clone(), port))
            }
            None => None,
        };

        let mut fake_ranges = Vec::new();
        if kind == DnsServerKind::FakeIp {
            for (field, value) in [("inet4_range", &options.inet4_range), ("inet6_range", &options.inet6_range)] {
                if value.is_empty() {
                    continue;
                }
                let range: IpCidr = value.parse().map_err(|_| BuildError::invalid(field, value.clone()))?;
                let family_ok = match (field, range.addr()) {
                    ("inet4_range", IpAddr::V4(_)) | ("inet6_range", IpAddr::V6(_)) => true,
                    _ => false,
                };
                if !family_ok {
                    return Err(BuildError::invalid(field, value.clone()));
                }
                fake_ranges.push(range);
            }
            if fake_ranges.is_empty() {
                return Err(BuildError::Missing("inet4_range"));
            }
        }

        Ok(Self {
            tag,
            kind,
            address,
            detour: (!options.detour.is_empty()).then(|| options.detour.clone()),
            domain_resolver: (!options.domain_resolver.is_empty()).then(|| options.domain_resolver.clone()),
            fake_ranges,
        })
    }
}

/// A server address is an IP or a plausible host name.
fn validate_host(server: &str) -> Result<(), BuildError> {
    if server.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let plausible = server.len() <= 253
        && server
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    if plausible {
        Ok(())
    } else {
        Err(BuildError::invalid("server", server))
    }
}

/// The DNS table of an engine.
#[derive(Debug)]
pub struct DnsRouter {
    servers: Vec<DnsServer>,
    index: HashMap<String, usize>,
    rules: Vec<Rule>,
    final_server: Option<String>,
}

impl DnsRouter {
    /// Build the table. `inbounds` and `outbounds` are the tags rules and
    /// detours may refer to.
    pub fn build(
        options: &DnsOptions,
        inbounds: &HashSet<String>,
        outbounds: &HashSet<String>,
    ) -> Result<Self, EngineError> {
        let mut servers = Vec::with_capacity(options.servers.len());
        let mut index = HashMap::new();
        for (i, opts) in options.servers.iter().enumerate() {
            let server = DnsServer::build(i, opts).map_err(|source| EngineError::DnsServer { index: i, source })?;
            if index.insert(server.tag.clone(), i).is_some() {
                return Err(EngineError::DnsServer {
                    index: i,
                    source: BuildError::DuplicateTag(server.tag),
                });
            }
            servers.push(server);
        }

        for (i, server) in servers.iter().enumerate() {
            let fail = |source| EngineError::DnsServer { index: i, source };
            if let Some(detour) = &server.detour {
                if !outbounds.contains(detour) {
                    return Err(fail(BuildError::OutboundNotFound(detour.clone())));
                }
            }
            if let Some(resolver) = &server.domain_resolver {
                if *resolver == server.tag {
                    return Err(fail(BuildError::SelfDetour(resolver.clone())));
                }
                if !index.contains_key(resolver) {
                    return Err(fail(BuildError::DnsServerNotFound(resolver.clone())));
                }
            }
        }

        let dns_tags: HashSet<String> = index.keys().cloned().collect();
        let scope = TagScope {
            inbounds,
            outbounds,
            dns_servers: &dns_tags,
        };
        let mut rules = Vec::with_capacity(options.rules.len());
        for (i, rule) in options.rules.iter().enumerate() {
            let compiled =
                compile_rule(rule, RuleTable::Dns, scope).map_err(|source| EngineError::DnsRule { index: i, source })?;
            rules.push(compiled);
        }

        let final_server = if options.final_server.is_empty() {
            servers.first().map(|s| s.tag.clone())
        } else if index.contains_key(&options.final_server) {
            Some(options.final_server.clone())
        } else {
            return Err(EngineError::Dns(BuildError::DnsServerNotFound(
                options.final_server.clone(),
            )));
        };

        validate_strategy(&options.strategy).map_err(EngineError::Dns)?;

        Ok(Self {
            servers,
            index,
            rules,
            final_server,
        })
    }

    pub fn tags(&self) -> HashSet<String> {
        self.index.keys().cloned().collect()
    }

    pub fn get(&self, tag: &str) -> Option<&DnsServer> {
        self.index.get(tag).map(|&i| &self.servers[i])
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Pick the server for a query. `None` means the system resolver
    /// (no servers configured) or a rejected query.
    pub fn select(&self, meta: &Metadata) -> Option<&DnsServer> {
        for rule in &self.rules {
            if !rule.action.is_final() || !rule.matcher.matches(meta) {
                continue;
            }
            return match &rule.action {
                RuleAction::Route(tag) => self.get(tag),
                _ => None,
            };
        }
        self.final_server.as_deref().and_then(|tag| self.get(tag))
    }
}
