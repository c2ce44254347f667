//! Configuration file watcher for hot reload.

use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::{ConfigParser, ConfigSource};
use crate::config::schema::Options;

/// A watcher that monitors the configuration files for changes.
pub struct ConfigWatcher {
    source: ConfigSource,
    update_tx: mpsc::UnboundedSender<Options>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for parsed configuration updates.
    pub fn new(source: ConfigSource) -> (Self, mpsc::UnboundedReceiver<Options>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (Self { source, update_tx }, update_rx)
    }

    /// Start watching. The returned watcher stops when dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let source = self.source.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(paths = ?event.paths, "Config file change detected, reloading");
                        match source.parse(None) {
                            Ok(options) => {
                                let _ = tx.send(options);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for path in self.source.watch_paths() {
            watcher.watch(&path, RecursiveMode::NonRecursive)?;
            tracing::info!(path = ?path, "Config watcher started");
        }
        Ok(watcher)
    }
}
