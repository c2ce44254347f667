//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Context (context.rs):
//!     created per check/run → passed to Engine::new → cancelled at the end
//!
//! Shutdown (shutdown.rs):
//!     Engine::close → trigger → every engine task exits → resources dropped
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → close engine and exit
//!     SIGHUP → reload configuration
//! ```
//!
//! # Design Decisions
//! - Two stop paths for engine tasks: the external context and the
//!   engine's own shutdown broadcast
//! - Ordered shutdown: stop accepting, drain, release

pub mod context;
pub mod shutdown;
pub mod signals;

pub use context::Context;
pub use shutdown::Shutdown;
pub use signals::{Signal, Signals};
