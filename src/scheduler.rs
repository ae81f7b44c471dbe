//! Decides when each source runs and keeps at most one run per source.
//!
//! # Architecture
//!
//! ```text
//! ticker ──► collect due sources ──► bounded queue ──► N workers ──► Process
//!                 │                                          │
//!                 └────────── per-source state table ◄───────┘
//! ```
//!
//! A source is marked `Queued` in the state table in the same critical
//! section that decides to enqueue it, so a tick never enqueues a source that
//! is already queued or running. The queue is bounded: when it is full the
//! ticker waits instead of spawning more work.
//!
//! Shutdown uses two tokens. `intake` stops the ticker and keeps workers from
//! taking new tasks. `deadline` fires after the grace period and is handed to
//! every run so in-flight fetches abort.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{SchedulerConfig, MAX_FETCH_INTERVAL_SECS};
use crate::processor::{Process, ProcessingOutcome};
use crate::sources::{SourceCatalog, SourceDefinition, SourceSet};

type Task = Arc<SourceDefinition>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Scheduler must be started inside a tokio runtime")]
    NoRuntime,

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Source is disabled: {0}")]
    SourceDisabled(String),
}

/// Lifecycle of one source inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Queued,
    Running,
    Disabled,
}

impl RunStatus {
    fn in_flight(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

/// Counts from the most recent completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub seen: usize,
    pub new: usize,
    pub updated: usize,
    pub filtered: usize,
    pub item_errors: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl From<&ProcessingOutcome> for RunSummary {
    fn from(outcome: &ProcessingOutcome) -> Self {
        Self {
            seen: outcome.seen,
            new: outcome.new,
            updated: outcome.updated,
            filtered: outcome.filtered,
            item_errors: outcome.item_errors,
            error: outcome.error.as_ref().map(ToString::to_string),
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug)]
struct SourceState {
    next_due_at: Instant,
    status: RunStatus,
    failure_streak: u32,
    last_completed: Option<Instant>,
    last_run: Option<RunSummary>,
}

impl SourceState {
    /// New sources are due immediately.
    fn new(now: Instant) -> Self {
        Self {
            next_due_at: now,
            status: RunStatus::Idle,
            failure_streak: 0,
            last_completed: None,
            last_run: None,
        }
    }
}

/// Point-in-time view of one source's schedule, for the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub source_id: String,
    pub status: RunStatus,
    pub failure_streak: u32,
    /// Zero when the source is already due
    pub next_due_in_secs: u64,
    pub last_completed_secs_ago: Option<u64>,
    pub last_run: Option<RunSummary>,
}

struct Inner {
    config: SchedulerConfig,
    catalog: Arc<SourceCatalog>,
    processor: Arc<dyn Process>,
    states: Mutex<HashMap<String, SourceState>>,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    intake: CancellationToken,
    deadline: CancellationToken,
}

/// Periodic scheduler over the sources in a [`SourceCatalog`].
pub struct Scheduler {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        catalog: Arc<SourceCatalog>,
        processor: Arc<dyn Process>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                processor,
                states: Mutex::new(HashMap::new()),
                sender: Mutex::new(None),
                intake: CancellationToken::new(),
                deadline: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers and the ticker.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::InvalidConfig`] - zero workers or zero queue capacity
    /// - [`SchedulerError::NoRuntime`] - called outside a tokio runtime
    /// - [`SchedulerError::AlreadyStarted`] - called twice, or after `stop()`
    pub fn start(&self) -> Result<(), SchedulerError> {
        let config = &self.inner.config;
        if config.worker_count == 0 {
            return Err(SchedulerError::InvalidConfig("worker_count must be at least 1"));
        }
        if config.queue_capacity == 0 {
            return Err(SchedulerError::InvalidConfig("queue_capacity must be at least 1"));
        }
        if config.tick_interval().is_zero() {
            return Err(SchedulerError::InvalidConfig("tick interval must be non-zero"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() || self.inner.intake.is_cancelled() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        *lock(&self.inner.sender) = Some(sender.clone());

        for worker_id in 0..config.worker_count {
            let inner = Arc::clone(&self.inner);
            let receiver = Arc::clone(&receiver);
            tasks.push(runtime.spawn(worker_loop(inner, receiver, worker_id)));
        }
        tasks.push(runtime.spawn(ticker_loop(Arc::clone(&self.inner), sender)));

        tracing::info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            tick_secs = config.tick_interval_secs,
            "Scheduler started"
        );
        Ok(())
    }

    /// Queue a run for `source_id` now, ignoring its due time.
    ///
    /// Returns `Ok(false)` when the source is already queued or running.
    pub async fn trigger_now(&self, source_id: &str) -> Result<bool, SchedulerError> {
        let set = self.inner.catalog.snapshot();
        let source = set
            .get(source_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownSource(source_id.to_string()))?;
        if !source.enabled {
            return Err(SchedulerError::SourceDisabled(source_id.to_string()));
        }
        let sender = lock(&self.inner.sender)
            .clone()
            .ok_or(SchedulerError::NotRunning)?;

        {
            let mut states = lock(&self.inner.states);
            let state = states
                .entry(source.id.clone())
                .or_insert_with(|| SourceState::new(Instant::now()));
            if state.status.in_flight() {
                tracing::debug!(source = %source.id, "Trigger ignored, run already in flight");
                return Ok(false);
            }
            state.status = RunStatus::Queued;
        }

        tracing::debug!(source = %source.id, "Run triggered");
        if self.inner.enqueue(&sender, source).await {
            Ok(true)
        } else {
            Err(SchedulerError::NotRunning)
        }
    }

    /// Run every enabled source once, `worker_count` at a time, and return
    /// the outcomes. Used for one-shot ingestion without starting the ticker.
    pub async fn run_all_once(&self) -> Vec<ProcessingOutcome> {
        use futures::stream::{self, StreamExt};

        let set = self.inner.catalog.snapshot();
        let sources: Vec<Task> = {
            let now = Instant::now();
            let mut states = lock(&self.inner.states);
            set.iter()
                .filter(|s| s.enabled)
                .filter(|s| {
                    let state = states
                        .entry(s.id.clone())
                        .or_insert_with(|| SourceState::new(now));
                    if state.status.in_flight() {
                        return false;
                    }
                    state.status = RunStatus::Queued;
                    true
                })
                .cloned()
                .collect()
        };

        stream::iter(sources)
            .map(|source| {
                let inner = Arc::clone(&self.inner);
                async move { inner.run(source).await }
            })
            .buffer_unordered(self.inner.config.worker_count.max(1))
            .collect()
            .await
    }

    /// Stop the ticker, stop workers from taking new tasks and wait up to
    /// the grace period for in-flight runs.
    ///
    /// Runs still going at the deadline are signalled to cancel and then
    /// abandoned. Tasks left in the queue are dropped and their sources go
    /// back to idle.
    pub async fn stop(&self) {
        self.inner.intake.cancel();
        lock(&self.inner.sender).take();
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        if tasks.is_empty() {
            return;
        }

        let grace = self.inner.config.shutdown_grace();
        match tokio::time::timeout(grace, futures::future::join_all(tasks)).await {
            Ok(_) => tracing::info!("Scheduler stopped"),
            Err(_) => {
                let abandoned = lock(&self.inner.states)
                    .values()
                    .filter(|s| s.status == RunStatus::Running)
                    .count();
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    abandoned,
                    "Shutdown grace period elapsed, cancelling in-flight runs"
                );
                self.inner.deadline.cancel();
            }
        }

        let released = self.inner.release_queued();
        if released > 0 {
            tracing::debug!(released, "Dropped queued runs at shutdown");
        }
    }

    /// Schedule state of every known source, ordered by id.
    pub fn snapshot(&self) -> Vec<ScheduleEntry> {
        let now = Instant::now();
        let states = lock(&self.inner.states);
        let mut entries: Vec<_> = states
            .iter()
            .map(|(id, state)| entry_view(id, state, now))
            .collect();
        entries.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        entries
    }

    /// Schedule state of one source, if the scheduler has seen it.
    pub fn entry(&self, source_id: &str) -> Option<ScheduleEntry> {
        let now = Instant::now();
        lock(&self.inner.states)
            .get(source_id)
            .map(|state| entry_view(source_id, state, now))
    }
}

impl Inner {
    /// Select due sources and mark them queued, in one critical section.
    ///
    /// Also syncs disabled state and prunes sources that left the snapshot.
    fn collect_due(&self, set: &SourceSet, now: Instant) -> Vec<Task> {
        let mut states = lock(&self.states);
        states.retain(|id, state| {
            let keep = set.contains(id) || state.status.in_flight();
            if !keep {
                tracing::debug!(source = %id, "Pruned state of removed source");
            }
            keep
        });

        let mut due = Vec::new();
        for source in set.iter() {
            let state = states
                .entry(source.id.clone())
                .or_insert_with(|| SourceState::new(now));

            if !source.enabled {
                if !state.status.in_flight() {
                    state.status = RunStatus::Disabled;
                }
                continue;
            }
            if state.status == RunStatus::Disabled {
                state.status = RunStatus::Idle;
                state.next_due_at = now;
            }
            if state.status.in_flight() {
                tracing::debug!(source = %source.id, status = ?state.status, "Skipping source, run in flight");
                continue;
            }
            if now < state.next_due_at {
                continue;
            }

            state.status = RunStatus::Queued;
            due.push(Arc::clone(source));
        }
        due
    }

    async fn tick(&self, sender: &mpsc::Sender<Task>) {
        let set = self.catalog.snapshot();
        let due = self.collect_due(&set, Instant::now());
        if !due.is_empty() {
            tracing::debug!(count = due.len(), "Enqueueing due sources");
        }
        for source in due {
            if !self.enqueue(sender, source).await {
                break;
            }
        }
    }

    /// Send a queued source to the workers, waiting while the queue is full.
    ///
    /// Returns false when shutdown began first; the source is reset to idle.
    async fn enqueue(&self, sender: &mpsc::Sender<Task>, source: Task) -> bool {
        let id = source.id.clone();
        let sent = tokio::select! {
            biased;
            _ = self.intake.cancelled() => false,
            result = sender.send(source) => result.is_ok(),
        };
        if !sent {
            if let Some(state) = lock(&self.states).get_mut(&id) {
                state.status = RunStatus::Idle;
            }
        }
        sent
    }

    fn release_queued(&self) -> usize {
        let mut states = lock(&self.states);
        let mut released = 0;
        for state in states.values_mut().filter(|s| s.status == RunStatus::Queued) {
            state.status = RunStatus::Idle;
            released += 1;
        }
        released
    }

    async fn run(&self, source: Task) -> ProcessingOutcome {
        if let Some(state) = lock(&self.states).get_mut(&source.id) {
            state.status = RunStatus::Running;
        }
        let outcome = self.processor.process(&source, &self.deadline).await;
        self.complete(&source, &outcome);
        outcome
    }

    fn complete(&self, source: &SourceDefinition, outcome: &ProcessingOutcome) {
        let now = Instant::now();
        let interval = source.interval_or(self.config.fetch_interval());

        let streak = {
            let mut states = lock(&self.states);
            let state = states
                .entry(source.id.clone())
                .or_insert_with(|| SourceState::new(now));
            state.status = RunStatus::Idle;
            state.next_due_at = next_due(now, interval);
            state.last_completed = Some(now);
            state.last_run = Some(RunSummary::from(outcome));
            if outcome.fetch_succeeded() {
                state.failure_streak = 0;
            } else {
                state.failure_streak = state.failure_streak.saturating_add(1);
            }
            state.failure_streak
        };

        match &outcome.error {
            None => tracing::info!(
                source = %source.id,
                seen = outcome.seen,
                new = outcome.new,
                updated = outcome.updated,
                filtered = outcome.filtered,
                duration_ms = outcome.duration.as_millis() as u64,
                "Source processed"
            ),
            Some(error) => tracing::warn!(
                source = %source.id,
                error = %error,
                failure_streak = streak,
                new = outcome.new,
                item_errors = outcome.item_errors,
                next_in_secs = interval.as_secs(),
                "Source run failed"
            ),
        }
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    worker_id: usize,
) {
    tracing::debug!(worker_id, "Worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = inner.intake.cancelled() => None,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(source) = next else {
            break;
        };
        inner.run(source).await;
    }
    tracing::debug!(worker_id, "Worker stopped");
}

async fn ticker_loop(inner: Arc<Inner>, sender: mpsc::Sender<Task>) {
    let mut interval = tokio::time::interval(inner.config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = inner.intake.cancelled() => break,
            _ = interval.tick() => {}
        }
        inner.tick(&sender).await;
    }
    tracing::debug!("Ticker stopped");
}

/// `now + interval`. An interval past the clock's range is capped at the
/// longest configurable one.
fn next_due(now: Instant, interval: Duration) -> Instant {
    now.checked_add(interval)
        .or_else(|| now.checked_add(Duration::from_secs(MAX_FETCH_INTERVAL_SECS)))
        .unwrap_or(now)
}

fn entry_view(id: &str, state: &SourceState, now: Instant) -> ScheduleEntry {
    ScheduleEntry {
        source_id: id.to_string(),
        status: state.status,
        failure_streak: state.failure_streak,
        next_due_in_secs: state.next_due_at.saturating_duration_since(now).as_secs(),
        last_completed_secs_ago: state
            .last_completed
            .map(|at| now.saturating_duration_since(at).as_secs()),
        last_run: state.last_run.clone(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
