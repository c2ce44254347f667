//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (inbound tag, source, destination, port)
//!     → router.rs (rule lookup)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: outbound tag, reject or hijack-dns
//!
//! Rule Compilation (at engine construction):
//!     RuleOptions[]
//!     → rule.rs (resolve tags, compile matchers)
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Rules compiled at construction, immutable at runtime
//! - Every tag reference is resolved at compile time
//! - Deterministic: same input always matches same rule
//! - First match wins (configuration order)

pub mod matcher;
pub mod router;
pub mod rule;

pub use matcher::{Host, Matcher, Metadata, Network};
pub use router::{tag_set, Decision, Router};
pub use rule::{compile_rule, Rule, RuleAction, RuleTable, TagScope};
