//! The `run` command: serve until told to stop, rebuilding on reload.

use crate::cli::CommandError;
use crate::config::{ConfigParser, ConfigSource, ConfigWatcher, Options};
use crate::engine::{EngineFactory, Instance};
use crate::lifecycle::{Context, Signal, Signals};
use crate::observability::LogHandle;

/// A running instance and the context it was built with.
struct Running<I> {
    ctx: Context,
    instance: I,
    options: Options,
}

impl<I: Instance> Running<I> {
    async fn stop(mut self) {
        self.instance.close().await;
        self.ctx.cancel();
    }
}

async fn start<F: EngineFactory>(
    factory: &F,
    options: Options,
    log: &LogHandle,
) -> Result<Running<F::Instance>, crate::engine::EngineError> {
    log.apply(&options.log);
    let ctx = Context::new();
    match factory.build(ctx.clone(), options.clone()).await {
        Ok(instance) => Ok(Running { ctx, instance, options }),
        Err(e) => {
            ctx.cancel();
            Err(e)
        }
    }
}

/// Serve the configuration from `source` until SIGINT or SIGTERM.
///
/// SIGHUP or a change of a watched file reparses the configuration. A
/// configuration that fails to parse leaves the running engine alone; one
/// that fails to build is replaced by the previous configuration.
pub async fn run<F: EngineFactory>(
    source: ConfigSource,
    factory: &F,
    log: &LogHandle,
) -> Result<(), CommandError> {
    let mut signals = Signals::new().map_err(CommandError::Signals)?;

    let options = source.parse(None)?;
    let mut running = start(factory, options, log).await?;
    tracing::info!("Proxy core started");

    let (watcher, mut updates) = ConfigWatcher::new(source.clone());
    // Held for the lifetime of the loop; dropping it stops watching.
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, reload on SIGHUP only");
            None
        }
    };

    loop {
        let next = tokio::select! {
            signal = signals.recv() => match signal {
                Signal::Shutdown => break,
                Signal::Reload => match source.parse(None) {
                    Ok(options) => options,
                    Err(e) => {
                        tracing::error!(error = %e, "Reload failed, keeping current configuration");
                        continue;
                    }
                },
            },
            Some(options) = updates.recv() => options,
        };

        let previous = running.options.clone();
        running.stop().await;
        running = match start(factory, next, log).await {
            Ok(running) => {
                tracing::info!("Proxy core reloaded");
                running
            }
            Err(e) => {
                tracing::error!(error = %e, "Reload failed, restoring previous configuration");
                start(factory, previous, log).await?
            }
        };
    }

    running.stop().await;
    tracing::info!("Proxy core stopped");
    Ok(())
}
