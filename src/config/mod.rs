//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config files (JSON/TOML) and directories
//!     → loader.rs (read, decode, merge in order)
//!     → schema.rs (deserialize into Options)
//!     → Options (immutable, handed to the engine)
//!     → engine construction performs the semantic checks
//!
//! On change (run command only):
//!     watcher.rs detects change
//!     → loader.rs parses the new configuration
//!     → run loop rebuilds the engine
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a full rebuild
//! - All fields have defaults to allow minimal configs
//! - Syntax (serde) is separated from semantics (engine construction)

pub mod loader;
pub mod schema;
pub mod types;
pub mod watcher;

pub use loader::{load_config, ConfigError, ConfigParser, ConfigSource};
pub use watcher::ConfigWatcher;
pub use schema::{
    DnsOptions, DnsServerOptions, InboundOptions, LogOptions, NtpOptions, Options,
    OutboundOptions, RouteOptions, RuleOptions,
};
pub use types::{DurationStr, Listable};
