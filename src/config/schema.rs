//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy
//! core. All types derive Serde traits for deserialization from config files.
//! Semantic checks (tag references, protocol fields, listen addresses) are
//! not done here; they happen when the engine is constructed.

use serde::{Deserialize, Serialize};

use crate::config::types::{DurationStr, Listable};

/// Root configuration of the proxy core.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Options {
    /// Logging settings.
    pub log: LogOptions,

    /// DNS servers and rules.
    pub dns: DnsOptions,

    /// Time synchronisation service.
    pub ntp: NtpOptions,

    /// Listening proxies.
    pub inbounds: Vec<InboundOptions>,

    /// Upstream proxies and terminal actions.
    pub outbounds: Vec<OutboundOptions>,

    /// Routing rules mapping connections to outbounds.
    pub route: RouteOptions,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct LogOptions {
    /// Disable all log output.
    pub disabled: bool,

    /// Log level (trace, debug, info, warn, error, fatal, panic).
    pub level: String,

    /// Prefix log lines with a timestamp.
    pub timestamp: bool,

    /// Output file path. Empty means the console.
    pub output: String,
}

/// Inbound (listener) configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct InboundOptions {
    /// Protocol: mixed, socks, http, direct or tun.
    #[serde(rename = "type")]
    pub kind: String,

    /// Unique name referenced by route rules.
    pub tag: String,

    /// Listen address (IP only).
    pub listen: String,

    /// Listen port.
    pub listen_port: u16,

    /// Proxy authentication users.
    pub users: Vec<UserOptions>,

    /// Fixed destination host of a `direct` inbound.
    pub override_address: String,

    /// Fixed destination port of a `direct` inbound.
    pub override_port: u16,

    /// Restrict the inbound to `tcp` or `udp`.
    pub network: String,

    /// Enable TCP Fast Open on the listener.
    pub tcp_fast_open: bool,

    /// Legacy sniffing switch, superseded by the `sniff` rule action.
    pub sniff: bool,

    /// tun: interface name.
    pub interface_name: String,

    /// tun: MTU.
    pub mtu: Option<u32>,

    /// tun: interface addresses (CIDR).
    pub address: Listable<String>,

    /// tun: install default routes.
    pub auto_route: bool,

    /// tun: reject traffic bypassing the interface.
    pub strict_route: bool,

    /// tun: network stack (system, gvisor, mixed).
    pub stack: String,

    /// mixed/http: register as system proxy.
    pub set_system_proxy: bool,
}

/// A username/password pair.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct UserOptions {
    pub username: String,
    pub password: String,
}

/// Outbound configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct OutboundOptions {
    /// Protocol or group type.
    #[serde(rename = "type")]
    pub kind: String,

    /// Unique name referenced by rules, groups and detours.
    pub tag: String,

    /// Server address.
    pub server: String,

    /// Server port.
    pub server_port: u16,

    pub username: String,

    pub password: String,

    /// shadowsocks: cipher.
    pub method: String,

    /// vmess/vless: user id.
    pub uuid: String,

    /// vless: flow control.
    pub flow: String,

    /// vmess: security.
    pub security: String,

    /// vmess: legacy alter id.
    pub alter_id: u32,

    /// Restrict to `tcp` or `udp`.
    pub network: String,

    /// selector/urltest: member outbound tags.
    pub outbounds: Vec<String>,

    /// selector: initially selected member.
    pub default: String,

    /// urltest: probe URL.
    pub url: String,

    /// urltest: probe interval.
    pub interval: DurationStr,

    /// urltest: latency tolerance in milliseconds.
    pub tolerance: u16,

    /// Close existing connections when the selection changes.
    pub interrupt_exist_connections: bool,

    /// Tag of the outbound used to reach `server`.
    pub detour: String,

    /// Resolution strategy for domain destinations.
    pub domain_strategy: String,

    pub multiplex: Option<MultiplexOptions>,

    pub tls: Option<TlsOptions>,
}

/// Stream multiplexing settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct MultiplexOptions {
    pub enabled: bool,
    pub protocol: String,
    pub max_streams: u32,
    pub padding: bool,
}

/// Outbound TLS settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct TlsOptions {
    pub enabled: bool,
    pub server_name: String,
    pub insecure: bool,
    pub alpn: Listable<String>,
}

/// DNS configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct DnsOptions {
    pub servers: Vec<DnsServerOptions>,

    pub rules: Vec<RuleOptions>,

    /// Tag of the server used when no rule matches.
    #[serde(rename = "final")]
    pub final_server: String,

    /// prefer_ipv4, prefer_ipv6, ipv4_only or ipv6_only.
    pub strategy: String,

    pub disable_cache: bool,

    pub independent_cache: bool,

    pub reverse_mapping: bool,
}

/// A DNS server definition.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct DnsServerOptions {
    /// local, hosts, dhcp, tcp, udp, tls, https, h3, quic or fakeip.
    #[serde(rename = "type")]
    pub kind: String,

    pub tag: String,

    pub server: String,

    pub server_port: u16,

    /// https/h3: request path.
    pub path: String,

    /// Tag of the outbound used to reach the server.
    pub detour: String,

    /// Tag of the DNS server used to resolve `server` when it is a domain.
    pub domain_resolver: String,

    /// fakeip: IPv4 pool.
    pub inet4_range: String,

    /// fakeip: IPv6 pool.
    pub inet6_range: String,
}

/// Route table configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct RouteOptions {
    pub rules: Vec<RuleOptions>,

    /// Tag of the outbound used when no rule matches.
    #[serde(rename = "final")]
    pub final_outbound: String,

    pub auto_detect_interface: bool,

    /// Tag of the DNS server used to resolve domain destinations.
    pub default_domain_resolver: String,
}

/// A route or DNS rule.
///
/// Default rules combine their non-empty conditions with AND semantics.
/// Logical rules (`"type": "logical"`) combine their nested `rules` according
/// to `mode`.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct RuleOptions {
    /// Empty, `default` or `logical`.
    #[serde(rename = "type")]
    pub kind: String,

    /// logical: `and` or `or`.
    pub mode: String,

    /// logical: nested rules.
    pub rules: Vec<RuleOptions>,

    pub inbound: Listable<String>,
    pub ip_version: Option<u8>,
    pub network: Listable<String>,
    pub protocol: Listable<String>,
    pub query_type: Listable<String>,
    pub domain: Listable<String>,
    pub domain_suffix: Listable<String>,
    pub domain_keyword: Listable<String>,
    pub domain_regex: Listable<String>,
    pub geosite: Listable<String>,
    pub geoip: Listable<String>,
    pub ip_cidr: Listable<String>,
    pub source_ip_cidr: Listable<String>,
    pub port: Listable<u16>,
    pub port_range: Listable<String>,
    pub source_port: Listable<u16>,
    pub process_name: Listable<String>,

    /// Negate the match result.
    pub invert: bool,

    /// route, reject, hijack-dns, sniff, resolve or route-options.
    /// Empty means `route`.
    pub action: String,

    /// route rules: target outbound tag.
    pub outbound: String,

    /// dns rules and `resolve` actions: target DNS server tag.
    pub server: String,

    /// `resolve` action: resolution strategy.
    pub strategy: String,
}

/// NTP service configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NtpOptions {
    pub enabled: bool,

    pub server: String,

    pub server_port: u16,

    /// Query interval.
    pub interval: DurationStr,

    /// Tag of the outbound used to reach the server.
    pub detour: String,
}

impl Default for NtpOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            server: String::new(),
            server_port: 123,
            interval: DurationStr::default(),
            detour: String::new(),
        }
    }
}
