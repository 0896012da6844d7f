use kvshield::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| KvError::Internal(e.to_string()))?;

    let store = Arc::new(MemoryStore::new(MemoryConfig::default()));
    let runner = TaskRunner::with_config(
        TaskRunnerConfig::default().retry_delay(Duration::from_secs(2)),
    );

    // Fails on its first run so the deferred retry is visible in the logs.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    runner.register("cleanup", "every 3s".parse()?, move || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(TaskError::new("database not ready"));
            }
            println!("  cleanup ran");
            Ok(())
        }
    })?;

    // Recomputes user stats in bounded batches, each one retried with backoff.
    let batch_store = store.clone();
    runner.register("user-stats", Schedule::every(Duration::from_secs(5)), move || {
        let store = batch_store.clone();
        async move {
            let retry = RetryExecutor::new(RetryPolicy::new(2, Duration::from_millis(200)));
            let result: BatchResult<u32, (), KvError> = BatchProcessor::new()
                .named("user-stats")
                .run(
                    (1..=10).collect(),
                    |id: u32| {
                        let store = store.clone();
                        let retry = retry.clone();
                        async move {
                            let key = format!("stats:{id}");
                            retry.run(|| store.set(&key, b"42".to_vec(), None)).await
                        }
                    },
                    3,
                )
                .await
                .map_err(|e| TaskError::permanent(e.to_string()))?;
            println!("  stats: {}/{} users", result.successful.len(), result.total);
            Ok(())
        }
    })?;

    tokio::time::sleep(Duration::from_secs(12)).await;

    for status in runner.tasks() {
        println!(
            "{} ({}): runs={} failures={} skipped={}",
            status.name, status.schedule, status.runs, status.failures, status.skipped
        );
    }
    runner.shutdown().await;
    Ok(())
}
