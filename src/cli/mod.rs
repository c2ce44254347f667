//! Command-line interface.
//!
//! # Data Flow
//! ```text
//! argv → Cli (clap derive)
//!     → change directory (-D)
//!     → ConfigSource (-c, -C)
//!     → check | run | version
//!     → Result back to main, which logs and sets the exit code
//! ```

pub mod check;
pub mod run;

use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::{ConfigError, ConfigSource};
use crate::engine::{EngineBuilder, EngineError};
use crate::observability::LogHandle;

pub use check::{check, CheckError};

#[derive(Debug, Parser)]
#[command(name = "proxy-core", about = "Rule based proxy core")]
pub struct Cli {
    /// Configuration file path (repeatable, `stdin` reads standard input)
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Vec<PathBuf>,

    /// Directory of configuration files (repeatable)
    #[arg(short = 'C', long = "config-directory", value_name = "DIR", global = true)]
    pub config_directory: Vec<PathBuf>,

    /// Set the working directory before anything else
    #[arg(short = 'D', long = "directory", value_name = "DIR", global = true)]
    pub directory: Option<PathBuf>,

    /// Disable color output
    #[arg(long, global = true)]
    pub disable_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Check configuration
    Check,
    /// Run service
    Run,
    /// Print version
    Version,
}

impl Cli {
    pub fn source(&self) -> ConfigSource {
        ConfigSource::new(self.config.clone(), self.config_directory.clone())
    }
}

/// Error returned by a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Check(#[from] CheckError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("set working directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

/// Run the selected command.
pub async fn execute(cli: Cli, log: &LogHandle) -> Result<(), CommandError> {
    if let Some(path) = &cli.directory {
        std::env::set_current_dir(path).map_err(|source| CommandError::Directory {
            path: path.clone(),
            source,
        })?;
    }

    match cli.command {
        Command::Check => check(&cli.source(), &EngineBuilder).await?,
        Command::Run => run::run(cli.source(), &EngineBuilder, log).await?,
        Command::Version => println!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}
