//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits)
//!     → connection.rs (lifecycle tracking)
//!     → engine dispatch (route → outbound)
//!     → connection.rs (bidirectional relay)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked so close can drain

pub mod cidr;
pub mod connection;
pub mod listener;

pub use cidr::IpCidr;
pub use connection::{relay, ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError, DEFAULT_MAX_CONNECTIONS};
