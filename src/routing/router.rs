//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled rules in configuration order
//! - Look up the decision for a connection
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - First final action wins; sniff/resolve/route-options only annotate
//! - No match falls through to the final outbound

use std::collections::HashSet;

use crate::config::RouteOptions;
use crate::engine::{BuildError, EngineError};
use crate::routing::matcher::Metadata;
use crate::routing::rule::{compile_rule, Rule, RuleAction, RuleTable, TagScope};

/// Result of routing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<'a> {
    Outbound(&'a str),
    Reject,
    HijackDns,
}

/// The route table.
#[derive(Debug)]
pub struct Router {
    rules: Vec<Rule>,
    final_outbound: String,
}

impl Router {
    /// Compile the route table.
    ///
    /// `default_outbound` is used when `final` is empty.
    pub fn build(
        options: &RouteOptions,
        scope: TagScope<'_>,
        default_outbound: &str,
    ) -> Result<Self, EngineError> {
        let mut rules = Vec::with_capacity(options.rules.len());
        for (index, rule) in options.rules.iter().enumerate() {
            let compiled = compile_rule(rule, RuleTable::Route, scope)
                .map_err(|source| EngineError::RouteRule { index, source })?;
            rules.push(compiled);
        }

        let final_outbound = if options.final_outbound.is_empty() {
            default_outbound.to_string()
        } else if scope.outbounds.contains(&options.final_outbound) {
            options.final_outbound.clone()
        } else {
            return Err(EngineError::Route(BuildError::OutboundNotFound(
                options.final_outbound.clone(),
            )));
        };

        if !options.default_domain_resolver.is_empty()
            && !scope.dns_servers.contains(&options.default_domain_resolver)
        {
            return Err(EngineError::Route(BuildError::DnsServerNotFound(
                options.default_domain_resolver.clone(),
            )));
        }

        tracing::debug!(rules = rules.len(), final_outbound = %final_outbound, "Route table built");
        Ok(Self {
            rules,
            final_outbound,
        })
    }

    /// Look up the decision for a connection.
    pub fn route(&self, meta: &Metadata) -> Decision<'_> {
        for (index, rule) in self.rules.iter().enumerate() {
            let decision = match &rule.action {
                RuleAction::Route(tag) => Decision::Outbound(tag),
                RuleAction::Reject => Decision::Reject,
                RuleAction::HijackDns => Decision::HijackDns,
                _ => continue,
            };
            if rule.matcher.matches(meta) {
                tracing::debug!(rule = index, inbound = %meta.inbound, destination = %meta.destination, "Rule matched");
                return decision;
            }
        }
        Decision::Outbound(&self.final_outbound)
    }

    pub fn final_outbound(&self) -> &str {
        &self.final_outbound
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Collect tags into a lookup set.
pub fn tag_set<'a>(tags: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    tags.into_iter().map(str::to_string).collect()
}
