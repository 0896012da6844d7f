//! Pattern-based cache invalidation tied to mutation outcomes

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use kvshield_core::{Component, Event, EventSink, KeyValueStore, Outcome, Result, TracingSink};

/// Keys removed for one pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternReport {
    pub pattern: String,
    /// Keys listed for the pattern
    pub matched: u64,
    /// Keys actually deleted; can be lower if some expired in between
    pub deleted: u64,
}

/// Result of an invalidation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub patterns: Vec<PatternReport>,
}

impl InvalidationReport {
    /// Total keys deleted across all patterns
    pub fn deleted(&self) -> u64 {
        self.patterns.iter().map(|p| p.deleted).sum()
    }

    pub fn matched(&self) -> u64 {
        self.patterns.iter().map(|p| p.matched).sum()
    }
}

/// Deletes cached keys matching glob patterns after successful mutations.
///
/// Listing and deleting are two separate store operations: a key written
/// after the listing and before the delete survives the pass. Callers who
/// need stronger guarantees should version their keys instead.
pub struct CacheInvalidator<St, E = TracingSink>
where
    St: KeyValueStore,
    E: EventSink,
{
    store: Arc<St>,
    sink: Arc<E>,
}

impl<St: KeyValueStore> CacheInvalidator<St, TracingSink> {
    pub fn new(store: Arc<St>) -> Self {
        Self::with_sink(store, Arc::new(TracingSink::new()))
    }
}

impl<St, E> CacheInvalidator<St, E>
where
    St: KeyValueStore,
    E: EventSink,
{
    pub fn with_sink(store: Arc<St>, sink: Arc<E>) -> Self {
        Self { store, sink }
    }

    /// Delete every key matching any of `patterns`.
    ///
    /// Patterns use Redis glob syntax (`user:42:*`). The first store error
    /// stops the pass and is returned.
    pub async fn invalidate<P: AsRef<str>>(&self, patterns: &[P]) -> Result<InvalidationReport> {
        let mut report = InvalidationReport::default();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            let started = Instant::now();

            let keys = self.store.keys_matching(pattern).await?;
            let deleted = if keys.is_empty() {
                0
            } else {
                self.store.delete_many(&keys).await?
            };

            self.sink.record(
                &Event::new(Component::Invalidator, "invalidate", pattern, Outcome::Success)
                    .duration(started.elapsed())
                    .count(deleted),
            );

            report.patterns.push(PatternReport {
                pattern: pattern.to_string(),
                matched: keys.len() as u64,
                deleted,
            });
        }

        Ok(report)
    }

    /// Delete exact keys
    pub async fn invalidate_keys<K: AsRef<str>>(&self, keys: &[K]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let deleted = self.store.delete_many(&keys).await?;

        self.sink.record(
            &Event::new(Component::Invalidator, "invalidate_keys", "", Outcome::Success)
                .duration(started.elapsed())
                .count(deleted),
        );
        Ok(deleted)
    }

    /// Invalidate `patterns` if the mutation succeeded.
    ///
    /// A failed mutation deletes nothing and returns `None`. Invalidation
    /// errors are logged and also yield `None`; they never turn a successful
    /// mutation into a failure.
    pub async fn after_mutation<T, Er, P>(
        &self,
        outcome: &std::result::Result<T, Er>,
        patterns: &[P],
    ) -> Option<InvalidationReport>
    where
        P: AsRef<str>,
    {
        if outcome.is_err() {
            self.sink.record(
                &Event::new(Component::Invalidator, "after_mutation", "", Outcome::Skipped)
                    .detail("mutation failed"),
            );
            return None;
        }

        match self.invalidate(patterns).await {
            Ok(report) => Some(report),
            Err(e) => {
                let detail = e.to_string();
                self.sink.record(
                    &Event::new(Component::Invalidator, "after_mutation", "", Outcome::Failure)
                        .detail(&detail),
                );
                None
            }
        }
    }

    /// Await a mutation, then invalidate `patterns` if it succeeded
    pub async fn run_mutation<T, Er, Fut, P>(
        &self,
        mutation: Fut,
        patterns: &[P],
    ) -> std::result::Result<T, Er>
    where
        Fut: Future<Output = std::result::Result<T, Er>>,
        P: AsRef<str>,
    {
        let outcome = mutation.await;
        self.after_mutation(&outcome, patterns).await;
        outcome
    }
}

impl<St, E> Clone for CacheInvalidator<St, E>
where
    St: KeyValueStore,
    E: EventSink,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sink: self.sink.clone(),
        }
    }
}
