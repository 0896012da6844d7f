//! Named recurring tasks with a single deferred retry on failure

mod schedule;

pub use schedule::Schedule;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use kvshield_core::{Component, Event, EventSink, KvError, Outcome, Result, TaskError, TracingSink};

/// Work run by a scheduled task
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self) -> std::result::Result<(), TaskError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), TaskError>> + Send,
{
    async fn run(&self) -> std::result::Result<(), TaskError> {
        (self)().await
    }
}

/// Configuration for [`TaskRunner`]
#[derive(Debug, Clone)]
pub struct TaskRunnerConfig {
    /// Wait between a failed scheduled run and its retry
    pub retry_delay: Duration,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(300),
        }
    }
}

impl TaskRunnerConfig {
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Where a task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Running,
    /// A failed run is waiting for its single retry
    RetryScheduled,
}

/// How the last completed run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(TaskError),
}

/// Why a run started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Retry,
    Manual,
}

impl Trigger {
    fn operation(self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled_run",
            Trigger::Retry => "retry_run",
            Trigger::Manual => "manual_run",
        }
    }
}

/// Point-in-time view of a registered task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub name: String,
    pub schedule: Schedule,
    pub phase: TaskPhase,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunOutcome>,
    /// Completed runs, any trigger
    pub runs: u64,
    pub failures: u64,
    /// Fires dropped because the task was still running
    pub skipped: u64,
    /// Deferred retries waiting for their delay
    pub pending_retries: u32,
}

struct TaskSlot {
    name: String,
    schedule: Schedule,
    handler: Arc<dyn TaskHandler>,
    running: AtomicBool,
    state: Mutex<TaskState>,
}

struct TaskState {
    phase: TaskPhase,
    last_run: Option<DateTime<Utc>>,
    last_outcome: Option<RunOutcome>,
    runs: u64,
    failures: u64,
    skipped: u64,
    pending_retries: u32,
}

impl TaskState {
    fn settled_phase(&self) -> TaskPhase {
        if self.pending_retries > 0 {
            TaskPhase::RetryScheduled
        } else {
            TaskPhase::Idle
        }
    }
}

/// Clears the running flag even if the handler panics
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TaskSlot {
    fn status(&self) -> TaskStatus {
        let state = self.state.lock();
        TaskStatus {
            name: self.name.clone(),
            schedule: self.schedule,
            phase: state.phase,
            last_run: state.last_run,
            last_outcome: state.last_outcome.clone(),
            runs: state.runs,
            failures: state.failures,
            skipped: state.skipped,
            pending_retries: state.pending_retries,
        }
    }

    /// Run the handler unless a run is already in flight.
    ///
    /// Returns `None` when the fire was skipped.
    async fn execute<E: EventSink>(
        &self,
        trigger: Trigger,
        sink: &E,
    ) -> Option<std::result::Result<(), TaskError>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.state.lock().skipped += 1;
            sink.record(
                &Event::new(Component::Scheduler, trigger.operation(), &self.name, Outcome::Skipped)
                    .detail("previous run still in progress"),
            );
            return None;
        }
        let _guard = RunningGuard(&self.running);

        self.state.lock().phase = TaskPhase::Running;
        let started = Instant::now();
        let result = self.handler.run().await;
        let elapsed = started.elapsed();

        let outcome = match &result {
            Ok(()) => RunOutcome::Succeeded,
            Err(e) => RunOutcome::Failed(e.clone()),
        };
        {
            let mut state = self.state.lock();
            state.phase = state.settled_phase();
            state.last_run = Some(Utc::now());
            state.runs += 1;
            if result.is_err() {
                state.failures += 1;
            }
            state.last_outcome = Some(outcome);
        }

        match &result {
            Ok(()) => sink.record(
                &Event::new(Component::Scheduler, trigger.operation(), &self.name, Outcome::Success)
                    .duration(elapsed),
            ),
            Err(e) => sink.record(
                &Event::new(Component::Scheduler, trigger.operation(), &self.name, Outcome::Failure)
                    .duration(elapsed)
                    .detail(e.message()),
            ),
        }

        Some(result)
    }

    fn retry_scheduled(&self) {
        let mut state = self.state.lock();
        state.pending_retries += 1;
        if state.phase != TaskPhase::Running {
            state.phase = TaskPhase::RetryScheduled;
        }
    }

    /// A pending retry is starting or was cancelled
    fn retry_settled(&self) {
        let mut state = self.state.lock();
        state.pending_retries = state.pending_retries.saturating_sub(1);
        if state.phase == TaskPhase::RetryScheduled {
            state.phase = state.settled_phase();
        }
    }
}

/// Runs named tasks on their schedules.
///
/// A task never overlaps itself: a fire that finds the previous run still
/// going is skipped and logged. A failed scheduled run gets exactly one retry
/// after [`TaskRunnerConfig::retry_delay`]; if the retry fails too, the task
/// waits for its next regular fire. Handlers can opt out of the retry by
/// failing with [`TaskError::permanent`].
///
/// Timers live on the tokio runtime the task was registered from. Shutting
/// down (or dropping) the runner cancels timers and pending retries; handlers
/// already running finish on their own.
pub struct TaskRunner<E = TracingSink>
where
    E: EventSink,
{
    tasks: Arc<DashMap<String, Arc<TaskSlot>>>,
    sink: Arc<E>,
    config: TaskRunnerConfig,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner<TracingSink> {
    pub fn new() -> Self {
        Self::with_config(TaskRunnerConfig::default())
    }

    pub fn with_config(config: TaskRunnerConfig) -> Self {
        Self::with_sink(Arc::new(TracingSink::new()), config)
    }
}

impl Default for TaskRunner<TracingSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventSink> TaskRunner<E> {
    pub fn with_sink(sink: Arc<E>, config: TaskRunnerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Arc::new(DashMap::new()),
            sink,
            config,
            shutdown,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler` under `name` and start its timer.
    ///
    /// Must be called from within a tokio runtime. Fails on a duplicate name,
    /// an invalid schedule, or after [`shutdown`](Self::shutdown).
    pub fn register<H: TaskHandler>(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        handler: H,
    ) -> Result<()> {
        let name = name.into();
        schedule.validate()?;
        if *self.shutdown.borrow() {
            return Err(KvError::Validation(format!(
                "cannot register {name}: runner is shut down"
            )));
        }

        let slot = match self.tasks.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(KvError::Validation(format!("task {name} already registered")));
            }
            Entry::Vacant(vacant) => {
                let slot = Arc::new(TaskSlot {
                    name: name.clone(),
                    schedule,
                    handler: Arc::new(handler),
                    running: AtomicBool::new(false),
                    state: Mutex::new(TaskState {
                        phase: TaskPhase::Idle,
                        last_run: None,
                        last_outcome: None,
                        runs: 0,
                        failures: 0,
                        skipped: 0,
                        pending_retries: 0,
                    }),
                });
                vacant.insert(slot.clone());
                slot
            }
        };

        let handle = tokio::spawn(schedule_loop(
            slot,
            self.sink.clone(),
            self.config.retry_delay,
            self.shutdown.subscribe(),
        ));
        self.loops.lock().push(handle);

        tracing::info!(target: "kvshield", task = %name, schedule = %schedule, "task registered");
        Ok(())
    }

    /// Run a task immediately, outside its schedule.
    ///
    /// A failure is returned to the caller and does not schedule a retry.
    pub async fn run_now(&self, name: &str) -> Result<()> {
        let slot = self
            .tasks
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KvError::Validation(format!("unknown task {name}")))?;

        match slot.execute(Trigger::Manual, self.sink.as_ref()).await {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(KvError::Task(e)),
            None => Err(KvError::AlreadyRunning(name.to_string())),
        }
    }

    pub fn status(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.get(name).map(|slot| slot.status())
    }

    /// Status of every registered task, sorted by name
    pub fn tasks(&self) -> Vec<TaskStatus> {
        let mut all: Vec<TaskStatus> = self.tasks.iter().map(|slot| slot.status()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Stop all timers and pending retries and wait for the timer loops to exit
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            let _ = handle.await;
        }
        tracing::info!(target: "kvshield", tasks = self.tasks.len(), "task runner stopped");
    }
}

/// Resolves once shutdown is requested or the runner is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn schedule_loop<E: EventSink>(
    slot: Arc<TaskSlot>,
    sink: Arc<E>,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_periodic = Instant::now();

    loop {
        let wake = match slot.schedule {
            Schedule::Every(period) => match next_periodic.checked_add(period) {
                Some(next) => {
                    next_periodic = next;
                    next
                }
                None => {
                    tracing::warn!(
                        target: "kvshield",
                        task = %slot.name,
                        ?period,
                        "period outside the timer range, task will only run manually"
                    );
                    stopped(&mut shutdown).await;
                    return;
                }
            },
            _ => match slot.schedule.until_next(Utc::now()) {
                Ok(wait) => Instant::now() + wait,
                Err(e) => {
                    tracing::error!(
                        target: "kvshield",
                        task = %slot.name,
                        error = %e,
                        "cannot compute next fire"
                    );
                    return;
                }
            },
        };

        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {
                tokio::spawn(fire(slot.clone(), sink.clone(), retry_delay, shutdown.clone()));
            }
            _ = stopped(&mut shutdown) => return,
        }
    }
}

/// One scheduled fire plus its single retry
async fn fire<E: EventSink>(
    slot: Arc<TaskSlot>,
    sink: Arc<E>,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let err = match slot.execute(Trigger::Scheduled, sink.as_ref()).await {
        Some(Err(err)) if err.is_retryable() => err,
        _ => return,
    };

    slot.retry_scheduled();
    let detail = format!("{}; retrying in {}s", err.message(), retry_delay.as_secs());
    sink.record(
        &Event::new(Component::Scheduler, "scheduled_run", &slot.name, Outcome::Retrying)
            .detail(&detail),
    );

    tokio::select! {
        _ = tokio::time::sleep(retry_delay) => slot.retry_settled(),
        _ = stopped(&mut shutdown) => {
            slot.retry_settled();
            return;
        }
    }

    // The retry's own failure is terminal until the next regular fire.
    slot.execute(Trigger::Retry, sink.as_ref()).await;
}
