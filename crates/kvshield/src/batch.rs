//! Chunked concurrent processing with per-item error capture

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;

use kvshield_core::{BatchResult, Component, Event, EventSink, KvError, Outcome, Result, TracingSink};

/// Runs an async operation over a list of items, `concurrency` at a time.
///
/// Items are split into consecutive chunks. All items of a chunk run
/// concurrently and the next chunk starts once every item of the current one
/// has settled, so a single slow item holds back the whole chunk.
pub struct BatchProcessor<E = TracingSink>
where
    E: EventSink,
{
    name: String,
    sink: Arc<E>,
}

impl BatchProcessor<TracingSink> {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(TracingSink::new()))
    }
}

impl Default for BatchProcessor<TracingSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventSink> BatchProcessor<E> {
    pub fn with_sink(sink: Arc<E>) -> Self {
        Self {
            name: "batch".to_string(),
            sink,
        }
    }

    /// Label used as the subject of progress events
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Apply `op` to every item.
    ///
    /// Item failures are collected in [`BatchResult::failed`] and never stop
    /// other items or later chunks. Fails only when `concurrency` is 0.
    pub async fn run<I, R, Er, F, Fut>(
        &self,
        items: Vec<I>,
        op: F,
        concurrency: usize,
    ) -> Result<BatchResult<I, R, Er>>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = std::result::Result<R, Er>>,
    {
        if concurrency == 0 {
            return Err(KvError::Validation("batch concurrency must be at least 1".into()));
        }

        let started = Instant::now();
        let mut result = BatchResult::with_total(items.len());

        for chunk in items.chunks(concurrency) {
            let outcomes = join_all(chunk.iter().cloned().map(|item| {
                let fut = op(item.clone());
                async move { (item, fut.await) }
            }))
            .await;

            for (item, outcome) in outcomes {
                match outcome {
                    Ok(value) => result.record_success(item, value),
                    Err(error) => result.record_failure(item, error),
                }
            }

            let progress = format!(
                "{}/{} processed, {} ok, {} failed",
                result.processed(),
                result.total,
                result.successful.len(),
                result.failed.len()
            );
            self.sink.record(
                &Event::new(Component::Batch, "chunk", &self.name, Outcome::Success)
                    .duration(started.elapsed())
                    .count(result.processed() as u64)
                    .detail(&progress),
            );
        }

        let outcome = if result.all_succeeded() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.sink.record(
            &Event::new(Component::Batch, "run", &self.name, outcome)
                .duration(started.elapsed())
                .count(result.failed.len() as u64),
        );

        Ok(result)
    }
}

impl<E: EventSink> Clone for BatchProcessor<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sink: self.sink.clone(),
        }
    }
}
