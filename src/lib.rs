//! Rule based proxy core library

pub mod cli;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;

pub use config::{ConfigParser, ConfigSource, Options};
pub use engine::{Engine, EngineBuilder, EngineError, EngineFactory, Instance};
pub use lifecycle::Context;
