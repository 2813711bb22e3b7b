//! Worker pool and scheduler loop.
//!
//! The [`Executor`] owns three task holders: the `ready` queue (newly ordered
//! tasks and tasks that just made progress), the `woken` queue (tasks moved
//! out of the parked list because their directive resolved) and the parked
//! list itself. Workers prefer `woken`, run exactly one step per dequeue and
//! never block on a task. A single scheduler thread wakes parked tasks every
//! tick and calls the [`TaskOrderer`] on a coarser cadence.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::config::ExecutorConfig;
use crate::core::{IterationTask, SchedulerError, StepOutcome};

/// Shortest idle wait of a worker, so a zero poll does not spin.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Source of new tasks, called once per order tick.
pub trait TaskOrderer: Send {
    /// Produce the tasks that became due since the last call.
    fn order(&mut self) -> Vec<IterationTask>;
}

impl<F> TaskOrderer for F
where
    F: FnMut() -> Vec<IterationTask> + Send,
{
    fn order(&mut self) -> Vec<IterationTask> {
        self()
    }
}

/// Snapshot of executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// Configured worker count.
    pub workers: usize,
    /// Workers whose thread is still running.
    pub alive_workers: usize,
    /// Tasks waiting in the ready queue.
    pub ready: usize,
    /// Tasks waiting in the woken queue.
    pub woken: usize,
    /// Tasks parked on a directive.
    pub parked: usize,
    /// Tasks currently held by a worker.
    pub active: usize,
    /// Tasks produced by the orderer or submitted directly.
    pub submitted: u64,
    /// Tasks whose sequence finished.
    pub completed: u64,
    /// Tasks dropped after an error or panic.
    pub failed: u64,
    /// Steps executed.
    pub steps: u64,
    /// Order ticks performed.
    pub order_ticks: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    steps: AtomicU64,
    order_ticks: AtomicU64,
    active: AtomicUsize,
}

struct WorkerSlot {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    config: ExecutorConfig,
    ready_tx: Sender<IterationTask>,
    ready_rx: Receiver<IterationTask>,
    woken_tx: Sender<IterationTask>,
    woken_rx: Receiver<IterationTask>,
    parked: Mutex<Vec<IterationTask>>,
    workers: Mutex<Vec<WorkerSlot>>,
    shutdown: AtomicBool,
    counters: Counters,
}

/// Fixed worker pool plus one scheduler thread.
pub struct Executor {
    shared: Arc<Shared>,
    orderer: Mutex<Option<Box<dyn TaskOrderer>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    /// Dropping the sender wakes the scheduler out of its tick wait.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor. Nothing runs until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if the configuration is invalid.
    pub fn new(config: ExecutorConfig, orderer: impl TaskOrderer + 'static) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::Config)?;
        let (ready_tx, ready_rx) = unbounded();
        let (woken_tx, woken_rx) = unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                ready_tx,
                ready_rx,
                woken_tx,
                woken_rx,
                parked: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            orderer: Mutex::new(Some(Box::new(orderer))),
            scheduler: Mutex::new(None),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        })
    }

    /// Spawn the workers and the scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Spawn`] if a thread cannot be started or the
    /// executor was already started.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let Some(orderer) = self.orderer.lock().take() else {
            return Err(SchedulerError::Spawn("executor already started".into()));
        };

        {
            let mut workers = self.shared.workers.lock();
            for id in 0..self.shared.config.workers {
                let handle = spawn_worker(id, Arc::clone(&self.shared))?;
                workers.push(WorkerSlot { id, handle: Some(handle) });
            }
        }

        let shared = Arc::clone(&self.shared);
        let stop_rx = self.stop_rx.clone();
        let handle = thread::Builder::new()
            .name("flowmaster-scheduler".into())
            .spawn(move || scheduler_loop(&shared, orderer, &stop_rx))
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
        *self.scheduler.lock() = Some(handle);

        info!(
            worker_count = self.shared.config.workers,
            tick_ms = self.shared.config.tick_interval_ms,
            order_ms = self.shared.config.order_interval_ms,
            "executor started"
        );
        Ok(())
    }

    /// Signal shutdown and join every thread. In-flight steps finish first.
    pub fn stop(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping executor");
        self.stop_tx.lock().take();

        if let Some(handle) = self.scheduler.lock().take() {
            if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
        let mut workers = self.shared.workers.lock();
        for slot in workers.iter_mut() {
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    warn!(worker_id = slot.id, "worker panicked");
                }
            }
        }
        info!(worker_count = workers.len(), "executor stopped");
    }

    /// Push a task onto the ready queue, bypassing the orderer.
    pub fn submit(&self, task: IterationTask) {
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.enqueue_ready(task);
    }

    /// Whether [`Self::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Whether every submitted task has finished or been dropped.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let counters = &self.shared.counters;
        let submitted = counters.submitted.load(Ordering::Acquire);
        let finished = counters.completed.load(Ordering::Acquire) + counters.failed.load(Ordering::Acquire);
        finished >= submitted
    }

    /// Whether the order tick budget (`max_orders`) is used up.
    #[must_use]
    pub fn orders_exhausted(&self) -> bool {
        self.shared.orders_exhausted()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        let shared = &self.shared;
        let counters = &shared.counters;
        let alive_workers = shared
            .workers
            .lock()
            .iter()
            .filter(|slot| slot.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .count();
        ExecutorStats {
            workers: shared.config.workers,
            alive_workers,
            ready: shared.ready_rx.len(),
            woken: shared.woken_rx.len(),
            parked: shared.parked.lock().len(),
            active: counters.active.load(Ordering::Relaxed),
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            steps: counters.steps.load(Ordering::Relaxed),
            order_ticks: counters.order_ticks.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Signal only; explicit stop() is required for a graceful join.
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            self.stop_tx.lock().take();
            debug!("executor dropped without explicit stop, threads detached");
        }
    }
}

impl Shared {
    fn enqueue_ready(&self, task: IterationTask) {
        // Both ends live in `Shared`, so the channel cannot be disconnected.
        let _ = self.ready_tx.send(task);
    }

    fn orders_exhausted(&self) -> bool {
        self.config
            .max_orders
            .is_some_and(|max| self.counters.order_ticks.load(Ordering::Acquire) >= u64::from(max))
    }

    fn next_task(&self) -> Option<IterationTask> {
        if let Ok(task) = self.woken_rx.try_recv() {
            return Some(task);
        }
        if let Ok(task) = self.ready_rx.try_recv() {
            return Some(task);
        }
        let wait = self.config.wake_poll().max(MIN_IDLE_WAIT);
        select! {
            recv(self.woken_rx) -> task => task.ok(),
            recv(self.ready_rx) -> task => task.ok(),
            default(wait) => None,
        }
    }

    fn run_step(&self, worker_id: usize, mut task: IterationTask) {
        self.counters.steps.fetch_add(1, Ordering::Relaxed);
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.step()));
        match result {
            Ok(Ok(StepOutcome::Progress(value))) => {
                debug!(worker_id, task = %task.name(), progress = %value, "task progressed");
                self.enqueue_ready(task);
            }
            Ok(Ok(StepOutcome::NotReady { wait })) => {
                trace!(worker_id, task = %task.name(), wait_ms = wait.as_millis(), "task parked");
                self.parked.lock().push(task);
            }
            Ok(Ok(StepOutcome::Done)) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    worker_id,
                    task = %task.name(),
                    iterations = task.iteration_count(),
                    elapsed_ms = task.elapsed_since_start().as_millis(),
                    "task finished"
                );
            }
            Ok(Err(err)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker_id, task = %task.name(), error = %err, "task failed and was dropped");
            }
            Err(payload) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id,
                    task = %task.name(),
                    panic = %panic_message(payload.as_ref()),
                    "task panicked and was dropped"
                );
            }
        }
    }

    /// Move every parked task that can make progress to the woken queue.
    /// Tasks past their deadline are woken too so the step reports it.
    fn wake_sleeping(&self) -> usize {
        let mut parked = self.parked.lock();
        let mut woken = 0;
        for task in std::mem::take(&mut *parked) {
            if task.is_ready() || task.deadline_passed() {
                let _ = self.woken_tx.send(task);
                woken += 1;
            } else {
                parked.push(task);
            }
        }
        if woken > 0 {
            trace!(woken, still_parked = parked.len(), "woke parked tasks");
        }
        woken
    }

    fn fill_queue(&self, orderer: &mut dyn TaskOrderer) {
        if self.orders_exhausted() {
            return;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| orderer.order())) {
            Ok(tasks) => {
                let count = tasks.len();
                for task in tasks {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    self.enqueue_ready(task);
                }
                if count > 0 {
                    info!(count, "tasks ordered");
                }
            }
            Err(payload) => {
                error!(panic = %panic_message(payload.as_ref()), "ordering function panicked");
            }
        }
        // Only after submission: a tick must never count before its tasks do.
        self.counters.order_ticks.fetch_add(1, Ordering::Release);
    }

    fn restart_dead_workers(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut workers = self.workers.lock();
        for slot in workers.iter_mut() {
            let dead = slot.handle.as_ref().map_or(true, JoinHandle::is_finished);
            if !dead {
                continue;
            }
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }
            warn!(worker_id = slot.id, "worker is not running, restarting");
            match spawn_worker(slot.id, Arc::clone(self)) {
                Ok(handle) => slot.handle = Some(handle),
                Err(err) => error!(worker_id = slot.id, error = %err, "failed to restart worker"),
            }
        }
    }
}

fn spawn_worker(worker_id: usize, shared: Arc<Shared>) -> Result<JoinHandle<()>, SchedulerError> {
    thread::Builder::new()
        .name(format!("flowmaster-worker-{worker_id}"))
        .spawn(move || {
            debug!(worker_id, "worker thread started");
            while !shared.shutdown.load(Ordering::Acquire) {
                let Some(task) = shared.next_task() else {
                    continue;
                };
                shared.counters.active.fetch_add(1, Ordering::Relaxed);
                shared.run_step(worker_id, task);
                shared.counters.active.fetch_sub(1, Ordering::Relaxed);
            }
            debug!(worker_id, "worker thread exiting");
        })
        .map_err(|e| SchedulerError::Spawn(e.to_string()))
}

fn scheduler_loop(shared: &Arc<Shared>, mut orderer: Box<dyn TaskOrderer>, stop_rx: &Receiver<()>) {
    debug!("scheduler thread started");
    let order_interval = shared.config.order_interval();
    let mut last_order: Option<Instant> = None;

    while !shared.shutdown.load(Ordering::Acquire) {
        shared.wake_sleeping();

        if last_order.map_or(true, |t| t.elapsed() >= order_interval) {
            last_order = Some(Instant::now());
            shared.restart_dead_workers();
            shared.fill_queue(orderer.as_mut());
        }

        match stop_rx.recv_timeout(shared.config.tick_interval()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("scheduler thread exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
