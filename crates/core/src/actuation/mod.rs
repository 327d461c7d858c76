//! Bounded command buffer between beat detection and the movement executor.
//!
//! Commands are enqueued without blocking and dropped when the buffer is
//! full. A worker thread executes them no closer together than the minimum
//! command interval, retrying failures a bounded number of times.

mod executor;
mod tello;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

pub use executor::{FlipDirection, Movement, MovementExecutor, SimulatedExecutor};
pub use tello::{TelloExecutor, DEFAULT_ADDRESS as TELLO_DEFAULT_ADDRESS};

use crate::{config::ActuationConfig, lifecycle::join_with_timeout, BeatSyncError, Result};

/// Executor shared between the worker thread and its owner.
pub type SharedExecutor = Arc<Mutex<Box<dyn MovementExecutor>>>;

pub fn shared_executor(executor: impl MovementExecutor + 'static) -> SharedExecutor {
    Arc::new(Mutex::new(Box::new(executor)))
}

/// A queued movement, stamped when it entered the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub movement: Movement,
    /// Band tag the movement was derived from, if any.
    pub category: Option<String>,
    pub enqueued_at: Instant,
}

impl Command {
    pub fn new(movement: Movement, category: Option<String>) -> Self {
        Self {
            movement,
            category,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Buffer full; the new command was discarded.
    Dropped,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActuationStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub executed: u64,
    pub failed: u64,
    pub attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ActuationStats {
        ActuationStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
        }
    }
}

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ActuationConfig) -> Self {
        Self {
            attempts: config.retry_count.max(1),
            backoff: config.retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Executed { attempts: u32 },
    Failed { attempts: u32, last_error: String },
}

/// Runs `command` until it succeeds or the policy is exhausted. The backoff
/// is skipped once `running` is cleared so shutdown is not delayed.
pub fn execute_with_retry(
    executor: &mut dyn MovementExecutor,
    command: &Command,
    policy: RetryPolicy,
    running: &AtomicBool,
) -> ExecutionOutcome {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match executor.execute(&command.movement) {
            Ok(()) => return ExecutionOutcome::Executed { attempts: attempt },
            Err(err) => {
                warn!(
                    executor = executor.name(),
                    command = %command.movement,
                    attempt,
                    attempts,
                    error = %err,
                    "movement failed"
                );
                last_error = err.to_string();
            }
        }

        if attempt < attempts {
            if !running.load(Ordering::SeqCst) {
                return ExecutionOutcome::Failed {
                    attempts: attempt,
                    last_error,
                };
            }
            thread::sleep(policy.backoff);
        }
    }

    ExecutionOutcome::Failed {
        attempts,
        last_error,
    }
}

/// Non-blocking handle used by beat listeners.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
    counters: Arc<Counters>,
}

impl CommandSender {
    pub fn submit(&self, command: Command) -> EnqueueOutcome {
        match self.tx.try_send(command) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Queued
            }
            Err(TrySendError::Full(command)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(command = %command.movement, "actuation queue full, command dropped");
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => EnqueueOutcome::Closed,
        }
    }

    pub fn enqueue(&self, movement: Movement, category: Option<String>) -> EnqueueOutcome {
        self.submit(Command::new(movement, category))
    }
}

/// Flags for one worker run. Every `start` gets a fresh token, so a worker
/// detached by a timed-out stop can never be switched back on.
#[derive(Debug)]
pub struct RunToken {
    running: AtomicBool,
    performance_ended: AtomicBool,
}

impl RunToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            performance_ended: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// True for exactly one caller: whoever ends the performance.
    fn claim_end(&self) -> bool {
        !self.performance_ended.swap(true, Ordering::SeqCst)
    }
}

/// The bounded command buffer plus its pacing settings.
#[derive(Debug)]
pub struct ActuationQueue {
    tx: Sender<Command>,
    rx: Receiver<Command>,
    counters: Arc<Counters>,
    /// Start of the most recent execution, shared by every worker.
    last_execution: Arc<Mutex<Option<Instant>>>,
    capacity: usize,
    min_interval: Duration,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl ActuationQueue {
    pub fn new(config: &ActuationConfig) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = bounded(config.capacity);
        Ok(Self {
            tx,
            rx,
            counters: Arc::new(Counters::default()),
            last_execution: Arc::new(Mutex::new(None)),
            capacity: config.capacity,
            min_interval: config.min_command_interval(),
            poll_interval: config.poll_interval(),
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
            counters: self.counters.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> ActuationStats {
        self.counters.snapshot()
    }

    /// Discards pending commands.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Spawns the worker that drains the queue into `executor` until `token`
    /// is cancelled.
    pub fn spawn_worker(
        &self,
        executor: SharedExecutor,
        token: Arc<RunToken>,
    ) -> Result<JoinHandle<()>> {
        let mut worker = ActuationWorker {
            rx: self.rx.clone(),
            counters: self.counters.clone(),
            last_execution: self.last_execution.clone(),
            min_interval: self.min_interval,
            poll_interval: self.poll_interval,
            retry: self.retry,
            executor,
            token,
        };

        let handle = thread::Builder::new()
            .name("actuation".to_string())
            .spawn(move || worker.run())?;
        Ok(handle)
    }
}

struct ActuationWorker {
    rx: Receiver<Command>,
    counters: Arc<Counters>,
    last_execution: Arc<Mutex<Option<Instant>>>,
    min_interval: Duration,
    poll_interval: Duration,
    retry: RetryPolicy,
    executor: SharedExecutor,
    token: Arc<RunToken>,
}

impl ActuationWorker {
    fn run(&mut self) {
        info!("actuation worker started");
        with_executor(&self.executor, |executor| executor.begin_performance());

        while self.token.is_running() {
            // Commands stay queued until the interval since the last
            // execution has elapsed.
            let remaining = self.remaining_interval();
            if !remaining.is_zero() {
                thread::sleep(remaining.min(self.poll_interval));
                continue;
            }

            match self.rx.recv_timeout(self.poll_interval) {
                Ok(command) => self.execute(command),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if self.token.claim_end() {
            with_executor(&self.executor, |executor| executor.end_performance());
        }
        info!("actuation worker stopped");
    }

    fn remaining_interval(&self) -> Duration {
        let last = self.last_execution.lock().map(|last| *last).unwrap_or(None);
        last.map(|last| self.min_interval.saturating_sub(last.elapsed()))
            .unwrap_or_default()
    }

    fn execute(&mut self, command: Command) {
        let waited = command.enqueued_at.elapsed();
        let retry = self.retry;
        let token = self.token.clone();

        let outcome = match self.executor.lock() {
            Ok(mut executor) => {
                // Re-checked under the executor lock: only one command runs
                // at a time, whichever worker holds it.
                let remaining = self.remaining_interval();
                if !remaining.is_zero() {
                    thread::sleep(remaining);
                }
                if let Ok(mut last) = self.last_execution.lock() {
                    *last = Some(Instant::now());
                }
                execute_with_retry(executor.as_mut(), &command, retry, &token.running)
            }
            Err(_) => ExecutionOutcome::Failed {
                attempts: 0,
                last_error: "executor lock poisoned".to_string(),
            },
        };

        match outcome {
            ExecutionOutcome::Executed { attempts } => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .attempts
                    .fetch_add(attempts as u64, Ordering::Relaxed);
                debug!(command = %command.movement, attempts, ?waited, "movement executed");
            }
            ExecutionOutcome::Failed {
                attempts,
                last_error,
            } => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .attempts
                    .fetch_add(attempts as u64, Ordering::Relaxed);
                error!(
                    command = %command.movement,
                    band = command.category.as_deref().unwrap_or("-"),
                    attempts,
                    error = %last_error,
                    "movement dropped after retries"
                );
            }
        }
    }
}

fn with_executor(
    executor: &SharedExecutor,
    step: impl FnOnce(&mut dyn MovementExecutor) -> Result<()>,
) {
    let result = match executor.lock() {
        Ok(mut executor) => step(executor.as_mut()),
        Err(_) => Err(BeatSyncError::InvalidState(
            "executor lock poisoned".to_string(),
        )),
    };
    if let Err(err) = result {
        warn!(error = %err, "executor lifecycle step failed");
    }
}

struct ActiveRun {
    token: Arc<RunToken>,
    worker: JoinHandle<()>,
}

/// Queue, executor and worker thread bundled for start/stop handling.
pub struct ActuationRuntime {
    queue: ActuationQueue,
    executor: SharedExecutor,
    active: Option<ActiveRun>,
}

impl ActuationRuntime {
    pub fn new(config: &ActuationConfig, executor: impl MovementExecutor + 'static) -> Result<Self> {
        Ok(Self {
            queue: ActuationQueue::new(config)?,
            executor: shared_executor(executor),
            active: None,
        })
    }

    pub fn sender(&self) -> CommandSender {
        self.queue.sender()
    }

    pub fn queue(&self) -> &ActuationQueue {
        &self.queue
    }

    pub fn stats(&self) -> ActuationStats {
        self.queue.stats()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let token = RunToken::new();
        let worker = self
            .queue
            .spawn_worker(self.executor.clone(), token.clone())?;
        self.active = Some(ActiveRun { token, worker });
        Ok(())
    }

    /// Blocks until the queue is empty or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.queue.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Cancels the worker and waits at most `timeout` for it. A worker that
    /// overruns is detached, and the performance is ended here instead; that
    /// call waits for any command still in flight to return.
    pub fn stop(&mut self, timeout: Duration) {
        let Some(ActiveRun { token, worker }) = self.active.take() else {
            return;
        };
        token.cancel();

        if join_with_timeout(worker, timeout, "actuation").is_none() && token.claim_end() {
            warn!("ending performance without the actuation worker");
            let result = match self.executor.lock() {
                Ok(mut executor) => executor.end_performance(),
                Err(poisoned) => poisoned.into_inner().end_performance(),
            };
            if let Err(err) = result {
                error!(error = %err, "failed to end performance");
            }
        }

        let discarded = self.queue.clear();
        if discarded > 0 {
            debug!(discarded, "pending commands discarded on stop");
        }
    }
}

impl std::fmt::Debug for ActuationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuationRuntime")
            .field("queue", &self.queue)
            .field("running", &self.active.is_some())
            .finish()
    }
}

impl Drop for ActuationRuntime {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}
