//! Deferred-job scheduler: a min-heap timer queue.
//!
//! One long-lived worker task owns the heap behind a mutex, waking every
//! second to pop all due jobs. Each due job is dispatched to a fresh worker
//! task under a five-minute deadline; an expired deadline records a failure
//! without tearing down the scheduler. Jobs due at the same instant are
//! delivered in heap sibling order, which is unspecified.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Poll interval of the worker loop.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline applied to each dispatched job.
pub const JOB_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// A deferred job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Caller-assigned job ID, used for cancellation.
    pub job_id: String,
    /// When the job becomes due.
    pub execute_at: DateTime<Utc>,
    /// Opaque payload handed to the dispatch handler.
    pub payload: serde_json::Value,
}

struct Entry {
    at_ms: i64,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Inverted so the std max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at_ms
            .cmp(&self.at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct HeapState {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

/// The timer queue. Cheap to share behind an [`Arc`].
pub struct Scheduler {
    state: Arc<Mutex<HeapState>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    tick: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler with the standard one-second tick.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tick(TICK_INTERVAL)
    }

    /// Creates a scheduler with a custom tick, for tests.
    #[must_use]
    pub fn with_tick(tick: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(HeapState::default())),
            shutdown,
            worker: Mutex::new(None),
            tick,
        }
    }

    /// Inserts a job.
    pub fn schedule(&self, job: Job) {
        let mut state = lock(&self.state);
        state.seq += 1;
        let seq = state.seq;
        debug!(job_id = %job.job_id, execute_at = %job.execute_at, "job scheduled");
        state.heap.push(Entry {
            at_ms: job.execute_at.timestamp_millis(),
            seq,
            job,
        });
    }

    /// Removes a pending job by ID. Linear scan; the queue holds at most
    /// thousands of jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut state = lock(&self.state);
        let before = state.heap.len();
        state.heap.retain(|entry| entry.job.job_id != job_id);
        let removed = state.heap.len() < before;
        if removed {
            info!(job_id = %job_id, "job cancelled");
        }
        removed
    }

    /// Number of jobs waiting to become due.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.state).heap.len()
    }

    /// Starts the worker loop, dispatching each due job to `handler` on its
    /// own task. Calling `start` on a running scheduler is a no-op.
    pub fn start<H, Fut>(&self, handler: H)
    where
        H: Fn(Job) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if worker.is_some() {
            return;
        }

        let state = Arc::clone(&self.state);
        let mut shutdown = self.shutdown.subscribe();
        let tick = self.tick;

        let handle = tokio::spawn(async move {
            info!("scheduler started");
            let mut workers = JoinSet::new();
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for job in pop_due(&state, Utc::now()) {
                            let handler = handler.clone();
                            workers.spawn(async move {
                                let job_id = job.job_id.clone();
                                debug!(job_id = %job_id, "executing scheduled job");
                                match tokio::time::timeout(JOB_DEADLINE, handler(job)).await {
                                    Ok(()) => debug!(job_id = %job_id, "job completed"),
                                    Err(_) => warn!(
                                        job_id = %job_id,
                                        deadline_secs = JOB_DEADLINE.as_secs(),
                                        "job deadline expired"
                                    ),
                                }
                            });
                        }
                        // Reap finished workers without blocking the tick.
                        while workers.try_join_next().is_some() {}
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    },
                }
            }

            while workers.join_next().await.is_some() {}
            info!("scheduler stopped");
        });

        *worker = Some(handle);
    }

    /// Stops polling and awaits outstanding workers.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn pop_due(state: &Arc<Mutex<HeapState>>, now: DateTime<Utc>) -> Vec<Job> {
    let now_ms = now.timestamp_millis();
    let mut state = lock(state);
    let mut due = Vec::new();
    while state
        .heap
        .peek()
        .is_some_and(|entry| entry.at_ms <= now_ms)
    {
        if let Some(entry) = state.heap.pop() {
            due.push(entry.job);
        }
    }
    due
}

fn lock(state: &Arc<Mutex<HeapState>>) -> std::sync::MutexGuard<'_, HeapState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;

    fn job(id: &str, execute_at: DateTime<Utc>) -> Job {
        Job {
            job_id: id.to_string(),
            execute_at,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_heap_pops_earliest_first() {
        let scheduler = Scheduler::new();
        let base = Utc::now();
        scheduler.schedule(job("late", base + chrono::Duration::seconds(30)));
        scheduler.schedule(job("early", base + chrono::Duration::seconds(10)));
        scheduler.schedule(job("middle", base + chrono::Duration::seconds(20)));

        let due = pop_due(&scheduler.state, base + chrono::Duration::seconds(60));
        let order: Vec<&str> = due.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_pop_due_leaves_future_jobs() {
        let scheduler = Scheduler::new();
        let base = Utc::now();
        scheduler.schedule(job("due", base - chrono::Duration::seconds(1)));
        scheduler.schedule(job("future", base + chrono::Duration::seconds(3600)));

        let due = pop_due(&scheduler.state, base);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job_id, "due");
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_cancel_removes_by_id() {
        let scheduler = Scheduler::new();
        let base = Utc::now();
        scheduler.schedule(job("keep", base + chrono::Duration::seconds(10)));
        scheduler.schedule(job("drop", base + chrono::Duration::seconds(10)));

        assert!(scheduler.cancel("drop"));
        assert!(!scheduler.cancel("drop"));
        assert_eq!(scheduler.pending(), 1);

        let due = pop_due(&scheduler.state, base + chrono::Duration::seconds(60));
        assert_eq!(due[0].job_id, "keep");
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_dispatches_due_jobs() {
        let scheduler = Arc::new(Scheduler::new());
        let executed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&executed);
        scheduler.start(move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            }
        });

        scheduler.schedule(job("a", Utc::now()));
        scheduler.schedule(job("b", Utc::now()));

        // Let the worker tick past the due instant.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(executed.load(AtomicOrdering::SeqCst), 2);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_awaits_outstanding_workers() {
        let scheduler = Arc::new(Scheduler::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&finished);
        scheduler.start(move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            }
        });

        scheduler.schedule(job("slow", Utc::now()));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        scheduler.stop().await;
        assert_eq!(finished.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop() {
        let scheduler = Arc::new(Scheduler::new());
        let executed = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&executed);
            scheduler.start(move |_job| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                }
            });
        }

        scheduler.schedule(job("once", Utc::now()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(executed.load(AtomicOrdering::SeqCst), 1);

        scheduler.stop().await;
    }
}
