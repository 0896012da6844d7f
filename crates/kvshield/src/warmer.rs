//! Periodic cache warmup from a list of sources

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use kvshield_core::{
    build_key, Component, Event, EventSink, KeyValueStore, KvError, Outcome, Result, Serializer,
};

use crate::batch::BatchProcessor;
use crate::reader::CacheAsideReader;

/// Produces the value to cache for one source
#[async_trait]
pub trait Loader<V>: Send + Sync + 'static {
    /// Load the value for `source`
    async fn load(&self, source: &str) -> Result<V>;
}

#[async_trait]
impl<V, F, Fut> Loader<V> for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send,
    V: Send + 'static,
{
    async fn load(&self, source: &str) -> Result<V> {
        (self)(source.to_string()).await
    }
}

/// Configuration for [`CacheWarmer`]
#[derive(Debug, Clone)]
pub struct WarmerConfig {
    /// Time between passes; also the TTL of warmed entries
    pub interval: Duration,
    /// Sources loaded at once
    pub concurrency: usize,
    /// Key prefix for warmed entries
    pub key_prefix: String,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            concurrency: 5,
            key_prefix: "warmup".to_string(),
        }
    }
}

impl WarmerConfig {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Outcome of one warmup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    /// Keys written during the pass
    pub stored: Vec<String>,
    /// Sources that failed, with the error text
    pub failed: Vec<(String, String)>,
    pub total: usize,
}

impl WarmReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.stored.len() == self.total
    }
}

/// Loads every source and stores the result ahead of the first request.
///
/// Each value is written under `<prefix>:url:<source>` with a TTL equal to
/// the refresh interval, so an entry lives until the next pass replaces it.
pub struct CacheWarmer<St, S, E, V, L>
where
    St: KeyValueStore,
    S: Serializer,
    E: EventSink,
    L: Loader<V>,
{
    reader: CacheAsideReader<St, S, E>,
    sources: Vec<String>,
    loader: L,
    sink: Arc<E>,
    config: WarmerConfig,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<St, S, E, V, L> CacheWarmer<St, S, E, V, L>
where
    St: KeyValueStore,
    S: Serializer,
    E: EventSink,
    V: Serialize + Send + Sync + 'static,
    L: Loader<V>,
{
    pub fn new(
        reader: CacheAsideReader<St, S, E>,
        sources: Vec<String>,
        loader: L,
        config: WarmerConfig,
    ) -> Self {
        let sink = reader.sink().clone();
        Self {
            reader,
            sources,
            loader,
            sink,
            config,
            _value: std::marker::PhantomData,
        }
    }

    /// Key a source is stored under
    pub fn key_for(&self, source: &str) -> String {
        build_key(&self.config.key_prefix, [("url", source)])
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Run one pass over all sources.
    ///
    /// Failed sources are logged and reported; they never abort the pass.
    pub async fn warm_once(&self) -> Result<WarmReport> {
        let started = Instant::now();
        let ttl = self.config.interval;
        let batch = BatchProcessor::with_sink(self.sink.clone()).named("warmup");

        let result = batch
            .run(
                self.sources.clone(),
                |source: String| async move {
                    let key = self.key_for(&source);
                    let value = self.loader.load(&source).await?;
                    self.reader.put(key.as_str(), &value, Some(ttl)).await?;
                    Ok::<_, KvError>(key)
                },
                self.config.concurrency,
            )
            .await?;

        for failure in &result.failed {
            let detail = failure.error.to_string();
            self.sink.record(
                &Event::new(Component::Warmer, "load", &failure.item, Outcome::Failure)
                    .detail(&detail),
            );
        }

        let report = WarmReport {
            stored: result.successful.into_iter().map(|s| s.result).collect(),
            failed: result
                .failed
                .into_iter()
                .map(|f| (f.item, f.error.to_string()))
                .collect(),
            total: result.total,
        };

        self.sink.record(
            &Event::new(Component::Warmer, "warm", &self.config.key_prefix, Outcome::Success)
                .duration(started.elapsed())
                .count(report.stored.len() as u64),
        );

        Ok(report)
    }

    fn record_failure(&self, err: &KvError) {
        let detail = err.to_string();
        self.sink.record(
            &Event::new(Component::Warmer, "warm", &self.config.key_prefix, Outcome::Failure)
                .detail(&detail),
        );
    }

    /// Spawn the refresh loop: one pass now, then one per interval.
    ///
    /// The loop stops when the handle is shut down or dropped. A pass that is
    /// already running finishes first.
    pub fn start(self) -> Result<WarmerHandle> {
        if self.config.interval.is_zero() {
            return Err(KvError::Validation("warmup interval must be non-zero".into()));
        }
        if self.config.concurrency == 0 {
            return Err(KvError::Validation("warmup concurrency must be at least 1".into()));
        }

        let period = self.config.interval;
        let warmer = Arc::new(self);
        let (tx, mut rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = warmer.warm_once().await {
                            warmer.record_failure(&e);
                        }
                    }
                    _ = &mut rx => break,
                }
            }
        });

        Ok(WarmerHandle {
            shutdown: Some(tx),
            join,
        })
    }
}

/// Handle to a running warmup loop
pub struct WarmerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl WarmerHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.join).await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
