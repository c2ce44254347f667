//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Map configured level names to filter directives
//! - Apply the configured level at runtime
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configuration file when set
//! - The filter sits behind a reload layer so a reload can change it

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::LogOptions;

/// Filter directive for a configured level name. `None` for unknown names.
///
/// An empty name means `info`. `fatal` and `panic` map to `error`.
pub fn level_filter(level: &str) -> Option<&'static str> {
    match level {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "" | "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "fatal" | "panic" => Some("error"),
        _ => None,
    }
}

/// Handle to the installed subscriber's level filter.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
}

impl LogHandle {
    /// Apply the `log` section of a configuration.
    pub fn apply(&self, options: &LogOptions) {
        if self.env_override {
            return;
        }
        let directive = if options.disabled {
            "off"
        } else {
            level_filter(&options.level).unwrap_or("info")
        };
        match self.filter.reload(EnvFilter::new(directive)) {
            Ok(()) => tracing::debug!(level = directive, "Log level applied"),
            Err(e) => tracing::debug!(error = %e, "Log level not applied"),
        }
    }
}

/// Install the global subscriber with `default_level` unless `RUST_LOG` is set.
pub fn init(default_level: &str, disable_color: bool) -> LogHandle {
    let env_override = std::env::var_os(EnvFilter::DEFAULT_ENV).is_some();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (filter_layer, filter) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            fmt::layer()
                .with_ansi(!disable_color)
                .with_writer(std::io::stderr),
        )
        .try_init();
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }

    LogHandle {
        filter,
        env_override,
    }
}
