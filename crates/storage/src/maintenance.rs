//! Background maintenance scheduler
//!
//! Runs the recurring commit, cleanup and consolidation work of every
//! registered data store on a small pool of worker threads. Tasks are kept
//! in a heap ordered by due time, then priority, then submission order.
//! A recurring task reschedules itself after each run until its store is
//! dropped, which it notices when the weak handle no longer locks.

use crate::handle::AsyncHandle;
use crate::store::{CommitResult, ConsolidationResult, DataStore};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tessera_core::{Error, Result, SearchConfig};
use tracing::{debug, error, warn};

/// Delay before re-checking a task whose interval is configured as 0
const DISABLED_POLL: Duration = Duration::from_secs(1);

/// Priority of maintenance work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Consolidation
    Low = 0,
    /// Periodic commit + cleanup
    Normal = 1,
    /// Explicitly requested work
    High = 2,
}

/// What a recurring task wants after a run
pub type Reschedule = Option<Duration>;

/// Scheduler metrics snapshot
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    /// Tasks waiting in the queue, due or not
    pub queue_depth: usize,
    /// Tasks being executed right now
    pub active_tasks: usize,
    /// Task runs completed since creation
    pub tasks_completed: u64,
    /// Worker threads
    pub worker_count: usize,
}

struct TaskEnvelope {
    run_at: Instant,
    priority: TaskPriority,
    sequence: u64,
    work: Box<dyn FnMut() -> Reschedule + Send>,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.priority == other.priority && self.sequence == other.sequence
    }
}

// Earliest due first, then higher priority, then older
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then(self.priority.cmp(&other.priority))
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<TaskEnvelope>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

impl SchedulerInner {
    fn push(&self, queue: &mut BinaryHeap<TaskEnvelope>, envelope: TaskEnvelope) {
        queue.push(envelope);
        self.work_ready.notify_one();
    }
}

/// Pool of worker threads running delayed and recurring maintenance tasks
pub struct MaintenanceScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("workers", &self.num_threads)
            .field("queue_depth", &self.inner.queue.lock().len())
            .finish()
    }
}

impl MaintenanceScheduler {
    /// Spawn `num_threads` workers named `tessera-maint-N`
    pub fn new(num_threads: usize, max_queue_depth: usize) -> Result<Self> {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("tessera-maint-{}", i))
                .spawn(move || worker_loop(&inner_clone))?;
            workers.push(handle);
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        })
    }

    /// Scheduler sized from the process configuration
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(config.maintenance_threads, config.maintenance_queue_depth)
    }

    /// Run `work` once, as soon as a worker is free
    pub fn submit(&self, priority: TaskPriority, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut work = Some(work);
        self.schedule(priority, Duration::ZERO, move || {
            if let Some(w) = work.take() {
                w();
            }
            None
        })
    }

    /// Run `work` after `delay`, then again after every delay it returns
    pub fn schedule(
        &self,
        priority: TaskPriority,
        delay: Duration,
        work: impl FnMut() -> Reschedule + Send + 'static,
    ) -> Result<()> {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(Error::internal("maintenance scheduler is shut down"));
        }
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.max_queue_depth {
            return Err(Error::internal("maintenance queue is full"));
        }
        let envelope = TaskEnvelope {
            run_at: Instant::now() + delay,
            priority,
            sequence: self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            work: Box::new(work),
        };
        self.inner.push(&mut queue, envelope);
        Ok(())
    }

    /// Start the periodic commit/cleanup and consolidation tasks of a store.
    ///
    /// Both tasks read the intervals from the store's current definition on
    /// every run and end once the store has been dropped.
    pub fn register(&self, handle: AsyncHandle<DataStore>) -> Result<()> {
        let meta = handle
            .lock()
            .ok_or_else(|| Error::not_found("cannot register a dropped index"))?
            .meta();

        let commit_handle = handle.clone();
        self.schedule(
            TaskPriority::Normal,
            interval(meta.commit_interval_msec),
            move || commit_task(&commit_handle),
        )?;
        self.schedule(
            TaskPriority::Low,
            interval(meta.consolidation_interval_msec),
            move || consolidation_task(&handle),
        )
    }

    /// Block until nothing is running and nothing is due
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        loop {
            let now = Instant::now();
            let due = queue.peek().map_or(false, |t| t.run_at <= now);
            if !due && self.inner.active_tasks.load(AtomicOrdering::Acquire) == 0 {
                return;
            }
            self.inner
                .drain_cond
                .wait_for(&mut queue, Duration::from_millis(10));
        }
    }

    /// Stop the workers and drop every pending task
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        {
            let mut queue = self.inner.queue.lock();
            queue.clear();
            self.inner.work_ready.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.inner.queue.lock().len(),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn interval(msec: u64) -> Duration {
    if msec == 0 {
        DISABLED_POLL
    } else {
        Duration::from_millis(msec)
    }
}

fn commit_task(handle: &AsyncHandle<DataStore>) -> Reschedule {
    let store = handle.lock()?;
    let meta = store.meta();
    if meta.commit_interval_msec == 0 {
        return Some(DISABLED_POLL);
    }
    match store.commit(false) {
        Ok(CommitResult::Done) => {
            let step = meta.cleanup_interval_step;
            if step > 0 && store.commits_since_cleanup() >= step {
                if let Err(e) = store.cleanup() {
                    warn!(target: "tessera::maintenance", index = %store.id(), error = %e, "scheduled cleanup failed");
                }
            }
        }
        Ok(CommitResult::NoChanges) | Ok(CommitResult::InProgress) => {}
        Err(e) => {
            warn!(target: "tessera::maintenance", index = %store.id(), error = %e, "scheduled commit failed");
        }
    }
    Some(interval(meta.commit_interval_msec))
}

fn consolidation_task(handle: &AsyncHandle<DataStore>) -> Reschedule {
    let store = handle.lock()?;
    let meta = store.meta();
    if meta.consolidation_interval_msec == 0 {
        return Some(DISABLED_POLL);
    }
    match store.consolidate(&meta.consolidation_policy) {
        Ok(ConsolidationResult::Done { merged }) => {
            debug!(target: "tessera::maintenance", index = %store.id(), merged, "scheduled consolidation done");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(target: "tessera::maintenance", index = %store.id(), error = %e, "scheduled consolidation failed");
        }
    }
    Some(interval(meta.consolidation_interval_msec))
}

/// Decrements `active_tasks` and wakes drain waiters, even if the task panicked
struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        self.inner.tasks_completed.fetch_add(1, AtomicOrdering::Relaxed);
        let _queue = self.inner.queue.lock();
        self.inner.drain_cond.notify_all();
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let mut task = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                let now = Instant::now();
                match queue.peek().map(|t| t.run_at) {
                    Some(run_at) if run_at <= now => {
                        if let Some(task) = queue.pop() {
                            inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                            break task;
                        }
                    }
                    Some(run_at) => {
                        inner.work_ready.wait_for(&mut queue, run_at - now);
                    }
                    None => inner.work_ready.wait(&mut queue),
                }
            }
        };

        let reschedule = {
            let _guard = ActiveTaskGuard { inner };
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (task.work)())) {
                Ok(r) => r,
                Err(e) => {
                    error!(
                        target: "tessera::maintenance",
                        "maintenance task panicked: {:?}",
                        e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                    );
                    None
                }
            }
        };

        if let Some(delay) = reschedule {
            if inner.shutdown.load(AtomicOrdering::Acquire) {
                continue;
            }
            task.run_at = Instant::now() + delay;
            task.sequence = inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
            let mut queue = inner.queue.lock();
            inner.push(&mut queue, task);
        }
    }
}
