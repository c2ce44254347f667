//! The `check` command: validate a configuration by building an engine.

use thiserror::Error;

use crate::config::{ConfigError, ConfigParser};
use crate::engine::{EngineError, EngineFactory, Instance};
use crate::lifecycle::Context;

/// Why a configuration failed the check.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Parse the configuration and construct an engine from it.
///
/// A successfully built engine is closed right away. The construction
/// context is cancelled before returning, whatever the outcome.
pub async fn check<P, F>(parser: &P, factory: &F) -> Result<(), CheckError>
where
    P: ConfigParser,
    F: EngineFactory,
{
    let options = parser.parse(None)?;

    let ctx = Context::new();
    let result = match factory.build(ctx.clone(), options).await {
        Ok(mut instance) => {
            instance.close().await;
            Ok(())
        }
        Err(e) => Err(e),
    };
    ctx.cancel();

    result?;
    tracing::debug!("Configuration check passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::engine::BuildError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct StaticParser {
        fail: bool,
    }

    impl ConfigParser for StaticParser {
        fn parse(&self, raw: Option<&[u8]>) -> Result<Options, ConfigError> {
            assert!(raw.is_none());
            if self.fail {
                crate::config::loader::parse_json(b"{", std::path::Path::new("config.json"))
            } else {
                Ok(Options::default())
            }
        }
    }

    #[derive(Default)]
    struct Counters {
        builds: AtomicUsize,
        closes: AtomicUsize,
        contexts: Mutex<Vec<Context>>,
    }

    struct MockFactory {
        fail: bool,
        counters: Arc<Counters>,
    }

    struct MockInstance {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Instance for MockInstance {
        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EngineFactory for MockFactory {
        type Instance = MockInstance;

        async fn build(&self, ctx: Context, _options: Options) -> Result<MockInstance, EngineError> {
            self.counters.builds.fetch_add(1, Ordering::SeqCst);
            assert!(!ctx.is_cancelled());
            self.counters.contexts.lock().unwrap().push(ctx);
            if self.fail {
                Err(EngineError::Route(BuildError::OutboundNotFound("proxy".into())))
            } else {
                Ok(MockInstance {
                    counters: Arc::clone(&self.counters),
                })
            }
        }
    }

    fn factory(fail: bool) -> (MockFactory, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            MockFactory {
                fail,
                counters: Arc::clone(&counters),
            },
            counters,
        )
    }

    #[tokio::test]
    async fn success_closes_instance_once() {
        let (factory, counters) = factory(false);
        check(&StaticParser { fail: false }, &factory).await.unwrap();

        assert_eq!(counters.builds.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(counters.contexts.lock().unwrap()[0].is_cancelled());
    }

    #[tokio::test]
    async fn parse_failure_skips_construction() {
        let (factory, counters) = factory(false);
        let err = check(&StaticParser { fail: true }, &factory).await.unwrap_err();

        assert!(matches!(err, CheckError::Config(_)));
        assert_eq!(counters.builds.load(Ordering::SeqCst), 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn construction_failure_is_returned_and_context_cancelled() {
        let (factory, counters) = factory(true);
        let err = check(&StaticParser { fail: false }, &factory).await.unwrap_err();

        assert_eq!(err.to_string(), "parse route options: outbound not found: proxy");
        assert!(matches!(err, CheckError::Engine(_)));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
        assert!(counters.contexts.lock().unwrap()[0].is_cancelled());
    }

    #[tokio::test]
    async fn repeated_checks_agree() {
        let (factory, counters) = factory(true);
        let parser = StaticParser { fail: false };
        let first = check(&parser, &factory).await.unwrap_err().to_string();
        let second = check(&parser, &factory).await.unwrap_err().to_string();

        assert_eq!(first, second);
        assert_eq!(counters.builds.load(Ordering::SeqCst), 2);
        let contexts = counters.contexts.lock().unwrap();
        assert!(contexts.iter().all(Context::is_cancelled));
    }
}
