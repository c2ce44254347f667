//! Rule condition matching.
//!
//! # Responsibilities
//! - Match connection metadata against a single condition
//! - Combine conditions with AND / OR semantics and inversion
//!
//! # Design Decisions
//! - Domain matching is case-insensitive
//! - Conditions this build cannot evaluate (geoip, geosite, domain_regex)
//!   never match
//! - No regex to guarantee O(n) matching

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::net::IpCidr;

/// Transport of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

/// Destination host of a connection or query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Domain(String),
    Ip(IpAddr),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(d) => f.write_str(d),
            Host::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

/// What is known about a connection when it is routed.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub inbound: String,
    pub network: Network,
    pub source: SocketAddr,
    pub destination: Host,
    pub port: u16,
    /// Sniffed application protocol.
    pub protocol: Option<String>,
    /// DNS query type (A, AAAA, ...) when routing a query.
    pub query_type: Option<String>,
    pub process_name: Option<String>,
}

impl Metadata {
    pub fn tcp(inbound: impl Into<String>, source: SocketAddr, destination: Host, port: u16) -> Self {
        Self {
            inbound: inbound.into(),
            network: Network::Tcp,
            source,
            destination,
            port,
            protocol: None,
            query_type: None,
            process_name: None,
        }
    }

    fn destination_domain(&self) -> Option<String> {
        match &self.destination {
            Host::Domain(d) => Some(d.trim_end_matches('.').to_lowercase()),
            Host::Ip(_) => None,
        }
    }

    fn destination_ip(&self) -> Option<IpAddr> {
        match &self.destination {
            Host::Ip(ip) => Some(*ip),
            Host::Domain(_) => None,
        }
    }
}

/// Trait for matching connections against conditions.
pub trait Matcher: Send + Sync + fmt::Debug {
    /// Returns true if the metadata matches this condition.
    fn matches(&self, meta: &Metadata) -> bool;
}

/// Matches the tag of the inbound that accepted the connection.
#[derive(Debug, Clone)]
pub struct InboundMatcher {
    tags: HashSet<String>,
}

impl InboundMatcher {
    pub fn new(tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
        }
    }
}

impl Matcher for InboundMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        self.tags.contains(&meta.inbound)
    }
}

#[derive(Debug, Clone)]
pub struct NetworkMatcher {
    networks: Vec<Network>,
}

impl NetworkMatcher {
    pub fn new(networks: Vec<Network>) -> Self {
        Self { networks }
    }
}

impl Matcher for NetworkMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        self.networks.contains(&meta.network)
    }
}

/// Matches the IP family of an IP destination.
#[derive(Debug, Clone)]
pub struct IpVersionMatcher {
    version: u8,
}

impl IpVersionMatcher {
    pub fn new(version: u8) -> Self {
        Self { version }
    }
}

impl Matcher for IpVersionMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        match meta.destination_ip() {
            Some(IpAddr::V4(_)) => self.version == 4,
            Some(IpAddr::V6(_)) => self.version == 6,
            None => false,
        }
    }
}

/// Case-insensitive membership over an optional string field.
#[derive(Debug, Clone)]
pub struct FieldMatcher {
    field: MetadataField,
    values: HashSet<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum MetadataField {
    Protocol,
    QueryType,
    ProcessName,
}

impl FieldMatcher {
    pub fn new(field: MetadataField, values: impl IntoIterator<Item = String>) -> Self {
        Self {
            field,
            values: values.into_iter().map(|v| v.to_lowercase()).collect(),
        }
    }
}

impl Matcher for FieldMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        let value = match self.field {
            MetadataField::Protocol => meta.protocol.as_deref(),
            MetadataField::QueryType => meta.query_type.as_deref(),
            MetadataField::ProcessName => meta.process_name.as_deref(),
        };
        value
            .map(|v| self.values.contains(&v.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Matches domain destinations by full name, suffix or keyword.
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    full: HashSet<String>,
    suffixes: Vec<String>,
    keywords: Vec<String>,
}

impl DomainMatcher {
    pub fn new(full: &[String], suffixes: &[String], keywords: &[String]) -> Self {
        Self {
            full: full.iter().map(|d| d.to_lowercase()).collect(),
            suffixes: suffixes
                .iter()
                .map(|s| s.trim_start_matches('.').to_lowercase())
                .collect(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.suffixes.is_empty() && self.keywords.is_empty()
    }
}

impl Matcher for DomainMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        let Some(domain) = meta.destination_domain() else {
            return false;
        };
        if self.full.contains(&domain) {
            return true;
        }
        // `example.com` as a suffix matches itself and any subdomain.
        let suffix_hit = self.suffixes.iter().any(|suffix| {
            domain == *suffix
                || (domain.ends_with(suffix.as_str())
                    && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
        });
        suffix_hit || self.keywords.iter().any(|k| domain.contains(k.as_str()))
    }
}

/// Matches the destination (or source) address against prefixes.
#[derive(Debug, Clone)]
pub struct IpCidrMatcher {
    source: bool,
    networks: Vec<IpCidr>,
}

impl IpCidrMatcher {
    pub fn destination(networks: Vec<IpCidr>) -> Self {
        Self {
            source: false,
            networks,
        }
    }

    pub fn source(networks: Vec<IpCidr>) -> Self {
        Self {
            source: true,
            networks,
        }
    }
}

impl Matcher for IpCidrMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        let ip = if self.source {
            Some(meta.source.ip())
        } else {
            meta.destination_ip()
        };
        ip.map(|ip| self.networks.iter().any(|n| n.contains(&ip)))
            .unwrap_or(false)
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Parse `start:end`, `start:` or `:end`.
    pub fn parse(text: &str) -> Option<Self> {
        let (start, end) = text.split_once(':')?;
        let start = if start.is_empty() { 0 } else { start.parse().ok()? };
        let end = if end.is_empty() { u16::MAX } else { end.parse().ok()? };
        (start <= end).then_some(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Matches the destination (or source) port.
#[derive(Debug, Clone)]
pub struct PortMatcher {
    source: bool,
    ports: HashSet<u16>,
    ranges: Vec<PortRange>,
}

impl PortMatcher {
    pub fn destination(ports: &[u16], ranges: Vec<PortRange>) -> Self {
        Self {
            source: false,
            ports: ports.iter().copied().collect(),
            ranges,
        }
    }

    pub fn source(ports: &[u16]) -> Self {
        Self {
            source: true,
            ports: ports.iter().copied().collect(),
            ranges: Vec::new(),
        }
    }
}

impl Matcher for PortMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        let port = if self.source { meta.source.port() } else { meta.port };
        self.ports.contains(&port) || self.ranges.iter().any(|r| r.contains(port))
    }
}

/// Placeholder for conditions that need data this build does not carry.
#[derive(Debug, Clone)]
pub struct NeverMatcher {
    pub condition: &'static str,
}

impl Matcher for NeverMatcher {
    fn matches(&self, _meta: &Metadata) -> bool {
        false
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        self.matchers.iter().all(|m| m.matches(meta))
    }
}

/// Combines multiple matchers with OR semantics.
#[derive(Debug)]
pub struct OrMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl OrMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for OrMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        self.matchers.iter().any(|m| m.matches(meta))
    }
}

#[derive(Debug)]
pub struct InvertMatcher {
    inner: Box<dyn Matcher>,
}

impl InvertMatcher {
    pub fn new(inner: Box<dyn Matcher>) -> Self {
        Self { inner }
    }
}

impl Matcher for InvertMatcher {
    fn matches(&self, meta: &Metadata) -> bool {
        !self.inner.matches(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(destination: Host, port: u16) -> Metadata {
        Metadata::tcp("mixed-in", "192.168.1.10:50000".parse().unwrap(), destination, port)
    }

    fn domain(d: &str) -> Host {
        Host::Domain(d.to_string())
    }

    #[test]
    fn test_domain_matcher() {
        let matcher = DomainMatcher::new(
            &["full.example".into()],
            &["example.com".into()],
            &["google".into()],
        );

        assert!(matcher.matches(&meta(domain("FULL.example"), 443)));
        assert!(matcher.matches(&meta(domain("example.com"), 443)));
        assert!(matcher.matches(&meta(domain("www.example.com"), 443)));
        assert!(!matcher.matches(&meta(domain("notexample.com"), 443)));
        assert!(matcher.matches(&meta(domain("mail.google.co"), 443)));
        assert!(!matcher.matches(&meta(Host::Ip("1.1.1.1".parse().unwrap()), 443)));
    }

    #[test]
    fn test_cidr_matcher() {
        let matcher = IpCidrMatcher::destination(vec!["10.0.0.0/8".parse().unwrap()]);
        assert!(matcher.matches(&meta(Host::Ip("10.2.3.4".parse().unwrap()), 80)));
        assert!(!matcher.matches(&meta(Host::Ip("11.2.3.4".parse().unwrap()), 80)));
        assert!(!matcher.matches(&meta(domain("10.example"), 80)));

        let source = IpCidrMatcher::source(vec!["192.168.0.0/16".parse().unwrap()]);
        assert!(source.matches(&meta(domain("example.com"), 80)));
    }

    #[test]
    fn test_port_range_parse() {
        assert_eq!(PortRange::parse("1000:2000"), Some(PortRange { start: 1000, end: 2000 }));
        assert_eq!(PortRange::parse(":80"), Some(PortRange { start: 0, end: 80 }));
        assert_eq!(PortRange::parse("8000:"), Some(PortRange { start: 8000, end: u16::MAX }));
        assert_eq!(PortRange::parse("2000:1000"), None);
        assert_eq!(PortRange::parse("80"), None);
    }

    #[test]
    fn test_port_matcher() {
        let matcher = PortMatcher::destination(&[53], vec![PortRange::parse("8000:8080").unwrap()]);
        assert!(matcher.matches(&meta(domain("a.com"), 53)));
        assert!(matcher.matches(&meta(domain("a.com"), 8042)));
        assert!(!matcher.matches(&meta(domain("a.com"), 443)));
    }

    #[test]
    fn test_combinators() {
        let inbound: Box<dyn Matcher> = Box::new(InboundMatcher::new(["mixed-in".to_string()]));
        let never: Box<dyn Matcher> = Box::new(NeverMatcher { condition: "geoip" });
        let m = meta(domain("a.com"), 80);

        let and = AndMatcher::new(vec![
            Box::new(InboundMatcher::new(["mixed-in".to_string()])),
            Box::new(NeverMatcher { condition: "geoip" }),
        ]);
        assert!(!and.matches(&m));

        let or = OrMatcher::new(vec![inbound, never]);
        assert!(or.matches(&m));

        let inverted = InvertMatcher::new(Box::new(or));
        assert!(!inverted.matches(&m));
    }

    #[test]
    fn test_query_type_matcher() {
        let matcher = FieldMatcher::new(MetadataField::QueryType, ["A".to_string(), "aaaa".to_string()]);
        let mut m = meta(domain("a.com"), 53);
        assert!(!matcher.matches(&m));
        m.query_type = Some("AAAA".into());
        assert!(matcher.matches(&m));
    }
}
