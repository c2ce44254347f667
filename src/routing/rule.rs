//! Rule compilation.
//!
//! Turns [`RuleOptions`] into a matcher plus an action, resolving every tag
//! the rule refers to against the tables built before it.
//!
//! A default rule groups its conditions the way users expect from a proxy
//! rule list: all destination-address conditions (domain, domain_suffix,
//! domain_keyword, domain_regex, geosite, geoip, ip_cidr) form one OR group,
//! destination ports (port, port_range) another, and every other condition
//! is ANDed with those groups.

use std::collections::HashSet;

use crate::config::RuleOptions;
use crate::engine::BuildError;
use crate::net::IpCidr;
use crate::routing::matcher::{
    AndMatcher, DomainMatcher, FieldMatcher, InboundMatcher, InvertMatcher, IpCidrMatcher,
    IpVersionMatcher, Matcher, MetadataField, NetworkMatcher, NeverMatcher, Network, OrMatcher,
    PortMatcher, PortRange,
};

/// Which table a rule belongs to; decides what `route` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTable {
    Route,
    Dns,
}

/// Tags a rule may refer to.
#[derive(Debug, Clone, Copy)]
pub struct TagScope<'a> {
    pub inbounds: &'a HashSet<String>,
    pub outbounds: &'a HashSet<String>,
    pub dns_servers: &'a HashSet<String>,
}

/// What happens to a matching connection or query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// Send to an outbound (route table) or DNS server (DNS table).
    Route(String),
    Reject,
    HijackDns,
    Sniff,
    Resolve { server: Option<String> },
    RouteOptions,
}

impl RuleAction {
    /// Final actions stop rule evaluation.
    pub fn is_final(&self) -> bool {
        matches!(self, RuleAction::Route(_) | RuleAction::Reject | RuleAction::HijackDns)
    }
}

/// A compiled rule.
#[derive(Debug)]
pub struct Rule {
    pub matcher: Box<dyn Matcher>,
    pub action: RuleAction,
}

/// Compile a top-level rule, including its action.
pub fn compile_rule(
    options: &RuleOptions,
    table: RuleTable,
    scope: TagScope<'_>,
) -> Result<Rule, BuildError> {
    let matcher = compile_matcher(options, scope)?;
    let action = compile_action(options, table, scope)?;
    Ok(Rule { matcher, action })
}

fn compile_action(
    options: &RuleOptions,
    table: RuleTable,
    scope: TagScope<'_>,
) -> Result<RuleAction, BuildError> {
    let action = match (options.action.as_str(), table) {
        ("" | "route", RuleTable::Route) => {
            if options.outbound.is_empty() {
                return Err(BuildError::Missing("outbound"));
            }
            if !scope.outbounds.contains(&options.outbound) {
                return Err(BuildError::OutboundNotFound(options.outbound.clone()));
            }
            RuleAction::Route(options.outbound.clone())
        }
        ("" | "route", RuleTable::Dns) => {
            if options.server.is_empty() {
                return Err(BuildError::Missing("server"));
            }
            if !scope.dns_servers.contains(&options.server) {
                return Err(BuildError::DnsServerNotFound(options.server.clone()));
            }
            RuleAction::Route(options.server.clone())
        }
        ("reject", _) => RuleAction::Reject,
        ("route-options", _) => RuleAction::RouteOptions,
        ("hijack-dns", RuleTable::Route) => RuleAction::HijackDns,
        ("sniff", RuleTable::Route) => RuleAction::Sniff,
        ("resolve", RuleTable::Route) => {
            if !options.strategy.is_empty() {
                validate_strategy(&options.strategy)?;
            }
            if options.server.is_empty() {
                RuleAction::Resolve { server: None }
            } else if scope.dns_servers.contains(&options.server) {
                RuleAction::Resolve {
                    server: Some(options.server.clone()),
                }
            } else {
                return Err(BuildError::DnsServerNotFound(options.server.clone()));
            }
        }
        (other, _) => return Err(BuildError::invalid("action", other)),
    };
    Ok(action)
}

/// Check a DNS resolution strategy name.
pub fn validate_strategy(strategy: &str) -> Result<(), BuildError> {
    match strategy {
        "" | "prefer_ipv4" | "prefer_ipv6" | "ipv4_only" | "ipv6_only" => Ok(()),
        other => Err(BuildError::invalid("strategy", other)),
    }
}

/// Compile only the conditions of a rule.
pub fn compile_matcher(
    options: &RuleOptions,
    scope: TagScope<'_>,
) -> Result<Box<dyn Matcher>, BuildError> {
    let matcher: Box<dyn Matcher> = match options.kind.as_str() {
        "" | "default" => compile_default(options, scope)?,
        "logical" => compile_logical(options, scope)?,
        other => return Err(BuildError::UnknownType { kind: "rule", name: other.to_string() }),
    };
    if options.invert {
        Ok(Box::new(InvertMatcher::new(matcher)))
    } else {
        Ok(matcher)
    }
}

fn compile_logical(
    options: &RuleOptions,
    scope: TagScope<'_>,
) -> Result<Box<dyn Matcher>, BuildError> {
    if options.rules.is_empty() {
        return Err(BuildError::Missing("rules"));
    }
    let children = options
        .rules
        .iter()
        .map(|rule| compile_matcher(rule, scope))
        .collect::<Result<Vec<_>, _>>()?;
    match options.mode.as_str() {
        "and" => Ok(Box::new(AndMatcher::new(children))),
        "or" => Ok(Box::new(OrMatcher::new(children))),
        "" => Err(BuildError::Missing("mode")),
        other => Err(BuildError::invalid("mode", other)),
    }
}

fn compile_default(
    options: &RuleOptions,
    scope: TagScope<'_>,
) -> Result<Box<dyn Matcher>, BuildError> {
    let mut all: Vec<Box<dyn Matcher>> = Vec::new();

    if !options.inbound.is_empty() {
        for tag in options.inbound.iter() {
            if !scope.inbounds.contains(tag) {
                return Err(BuildError::InboundNotFound(tag.clone()));
            }
        }
        all.push(Box::new(InboundMatcher::new(options.inbound.iter().cloned())));
    }

    if let Some(version) = options.ip_version {
        if version != 4 && version != 6 {
            return Err(BuildError::invalid("ip_version", version.to_string()));
        }
        all.push(Box::new(IpVersionMatcher::new(version)));
    }

    if !options.network.is_empty() {
        let networks = options
            .network
            .iter()
            .map(|n| parse_network(n))
            .collect::<Result<Vec<_>, _>>()?;
        all.push(Box::new(NetworkMatcher::new(networks)));
    }

    if !options.protocol.is_empty() {
        all.push(Box::new(FieldMatcher::new(
            MetadataField::Protocol,
            options.protocol.iter().cloned(),
        )));
    }

    if !options.query_type.is_empty() {
        all.push(Box::new(FieldMatcher::new(
            MetadataField::QueryType,
            options.query_type.iter().cloned(),
        )));
    }

    if !options.process_name.is_empty() {
        all.push(Box::new(FieldMatcher::new(
            MetadataField::ProcessName,
            options.process_name.iter().cloned(),
        )));
    }

    if !options.source_ip_cidr.is_empty() {
        let networks = parse_cidrs("source_ip_cidr", &options.source_ip_cidr)?;
        all.push(Box::new(IpCidrMatcher::source(networks)));
    }

    if !options.source_port.is_empty() {
        all.push(Box::new(PortMatcher::source(&options.source_port)));
    }

    // Destination address group.
    let mut destination: Vec<Box<dyn Matcher>> = Vec::new();
    let domains = DomainMatcher::new(&options.domain, &options.domain_suffix, &options.domain_keyword);
    if !domains.is_empty() {
        destination.push(Box::new(domains));
    }
    if !options.domain_regex.is_empty() {
        destination.push(Box::new(NeverMatcher { condition: "domain_regex" }));
    }
    if !options.geosite.is_empty() {
        destination.push(Box::new(NeverMatcher { condition: "geosite" }));
    }
    if !options.geoip.is_empty() {
        destination.push(Box::new(NeverMatcher { condition: "geoip" }));
    }
    if !options.ip_cidr.is_empty() {
        let networks = parse_cidrs("ip_cidr", &options.ip_cidr)?;
        destination.push(Box::new(IpCidrMatcher::destination(networks)));
    }
    if !destination.is_empty() {
        all.push(Box::new(OrMatcher::new(destination)));
    }

    // Destination port group.
    if !options.port.is_empty() || !options.port_range.is_empty() {
        let ranges = options
            .port_range
            .iter()
            .map(|r| PortRange::parse(r).ok_or_else(|| BuildError::invalid("port_range", r.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        all.push(Box::new(PortMatcher::destination(&options.port, ranges)));
    }

    if all.is_empty() {
        return Err(BuildError::Missing("conditions"));
    }
    Ok(Box::new(AndMatcher::new(all)))
}

/// Parse a `tcp` / `udp` network name.
pub fn parse_network(name: &str) -> Result<Network, BuildError> {
    match name {
        "tcp" => Ok(Network::Tcp),
        "udp" => Ok(Network::Udp),
        other => Err(BuildError::invalid("network", other)),
    }
}

fn parse_cidrs(field: &'static str, values: &[String]) -> Result<Vec<IpCidr>, BuildError> {
    values
        .iter()
        .map(|v| v.parse::<IpCidr>().map_err(|_| BuildError::invalid(field, v.clone())))
        .collect()
}
