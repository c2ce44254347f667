//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields
//!     → logging.rs (filter, format, stderr)
//!
//! Run command reload:
//!     → log section of the new configuration
//!     → LogHandle::apply (swap the level filter)
//! ```
//!
//! # Design Decisions
//! - One fmt layer on stderr; stdout stays free for command output
//! - Level names follow the configuration file, `RUST_LOG` overrides them

pub mod logging;

pub use logging::{init, level_filter, LogHandle};
