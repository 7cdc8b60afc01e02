//! Process-wide checkpoint coordination.
//!
//! Every session inside a run loop is a *running writer*. When the write-ahead
//! log grows past the global threshold, the next time each running writer
//! finishes an iteration it arrives at a single-flight barrier: the last
//! writer to arrive performs the checkpoint while all others wait on a
//! condition variable, then everyone resumes. Sessions with their own local
//! threshold bypass the barrier and checkpoint on their own.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::engine::{EngineError, GrowthObserver};

#[derive(Debug, Default)]
struct CoordinatorState {
    checkpoint_required: bool,
    running_writers: usize,
    waiting_writers: usize,
    cycles: u64,
    busy: u64,
}

/// Snapshot of the coordinator's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Whether a global checkpoint is pending.
    pub checkpoint_required: bool,
    /// Sessions currently inside a run loop.
    pub running: usize,
    /// Sessions blocked at the barrier.
    pub waiting: usize,
    /// Completed barrier cycles.
    pub cycles: u64,
    /// Cycles whose checkpoint reported busy.
    pub busy: u64,
}

/// What a call to [`CheckpointCoordinator::maybe_checkpoint`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// No checkpoint was pending.
    NotRequired,
    /// This writer ran the checkpoint successfully.
    Performed,
    /// This writer ran the checkpoint and it reported busy; the cycle is
    /// considered done and the next threshold crossing retries.
    Busy,
    /// Another writer ran the checkpoint while this one waited.
    Waited,
    /// This writer ran the checkpoint and it failed with a non-transient error.
    Failed(EngineError),
}

/// Shared barrier state. One instance per process.
#[derive(Debug)]
pub struct CheckpointCoordinator {
    threshold: u64,
    state: Mutex<CoordinatorState>,
    cond: Condvar,
}

impl CheckpointCoordinator {
    /// Creates a coordinator. A `threshold` of zero disables global mode.
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            state: Mutex::new(CoordinatorState::default()),
            cond: Condvar::new(),
        }
    }

    /// Global checkpoint trigger in WAL frames; zero when disabled.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Registers the caller as a running writer until the guard is dropped.
    pub fn enter(&self) -> RunningWriter<'_> {
        let mut state = self.state.lock();
        state.running_writers += 1;
        debug!(running = state.running_writers, "coordinator.enter");
        RunningWriter { coordinator: self }
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.running_writers > state.waiting_writers);
        state.running_writers -= 1;
        debug!(running = state.running_writers, "coordinator.leave");
        // The barrier's arrival count just shrank; a waiter may now be the last one in.
        if state.checkpoint_required && state.waiting_writers > 0 {
            self.cond.notify_all();
        }
    }

    /// Feeds a growth metric reported by any session's storage hook.
    pub fn observe_growth(&self, frames: u64) {
        if self.threshold == 0 || frames < self.threshold {
            return;
        }
        let mut state = self.state.lock();
        if !state.checkpoint_required {
            debug!(frames, threshold = self.threshold, "coordinator.checkpoint.requested");
        }
        state.checkpoint_required = true;
    }

    /// Arrives at the barrier if a checkpoint is pending.
    ///
    /// The last running writer to arrive runs `checkpoint` while holding the
    /// coordinator lock; every other running writer blocks until it is done.
    pub fn maybe_checkpoint<F>(&self, _writer: &RunningWriter<'_>, checkpoint: F) -> CheckpointOutcome
    where
        F: FnOnce() -> Result<(), EngineError>,
    {
        let mut state = self.state.lock();
        if !state.checkpoint_required {
            return CheckpointOutcome::NotRequired;
        }
        let cycle = state.cycles;
        loop {
            if state.cycles != cycle {
                return CheckpointOutcome::Waited;
            }
            debug_assert!(state.waiting_writers < state.running_writers);
            if state.waiting_writers + 1 == state.running_writers {
                let outcome = match checkpoint() {
                    Ok(()) => {
                        info!(cycle, writers = state.running_writers, "coordinator.checkpoint.performed");
                        CheckpointOutcome::Performed
                    }
                    Err(err) if err.is_transient() => {
                        state.busy += 1;
                        debug!(cycle, error = %err, "coordinator.checkpoint.busy");
                        CheckpointOutcome::Busy
                    }
                    Err(EngineError::Closed) => {
                        debug!(cycle, "coordinator.checkpoint.store_closed");
                        CheckpointOutcome::Failed(EngineError::Closed)
                    }
                    Err(err) => {
                        error!(cycle, error = %err, "coordinator.checkpoint.failed");
                        CheckpointOutcome::Failed(err)
                    }
                };
                state.checkpoint_required = false;
                state.cycles += 1;
                self.cond.notify_all();
                return outcome;
            }
            state.waiting_writers += 1;
            debug!(cycle, waiting = state.waiting_writers, "coordinator.barrier.wait");
            self.cond.wait(&mut state);
            state.waiting_writers -= 1;
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CoordinatorStats {
        let state = self.state.lock();
        CoordinatorStats {
            checkpoint_required: state.checkpoint_required,
            running: state.running_writers,
            waiting: state.waiting_writers,
            cycles: state.cycles,
            busy: state.busy,
        }
    }
}

/// Proof that the holder is counted in `running_writers`.
///
/// Dropping the guard leaves the run loop exactly once, on every exit path.
#[derive(Debug)]
pub struct RunningWriter<'a> {
    coordinator: &'a CheckpointCoordinator,
}

impl RunningWriter<'_> {
    /// Leaves the run loop now instead of at end of scope.
    pub fn leave(self) {}
}

impl Drop for RunningWriter<'_> {
    fn drop(&mut self) {
        self.coordinator.leave();
    }
}

/// Per-session checkpoint trigger, used when the session sets its own threshold.
#[derive(Debug, Default)]
pub struct LocalCheckpoint {
    threshold: AtomicU64,
    required: AtomicBool,
}

impl LocalCheckpoint {
    /// Sets the session threshold; zero hands the session back to global mode.
    pub fn set_threshold(&self, frames: u64) {
        self.threshold.store(frames, Ordering::SeqCst);
        if frames == 0 {
            self.required.store(false, Ordering::SeqCst);
        }
    }

    /// The session threshold in frames.
    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::SeqCst)
    }

    /// Whether the session owes a checkpoint.
    pub fn is_required(&self) -> bool {
        self.required.load(Ordering::SeqCst)
    }

    /// Marks the owed checkpoint as done.
    pub fn clear(&self) {
        self.required.store(false, Ordering::SeqCst);
    }

    fn observe(&self, frames: u64) {
        if frames >= self.threshold() {
            self.required.store(true, Ordering::SeqCst);
        }
    }
}

/// Growth observer installed on each session's engine connection.
///
/// Routes the metric to the session's own trigger when it has a local
/// threshold, otherwise to the shared coordinator.
pub struct SessionHook {
    coordinator: Arc<CheckpointCoordinator>,
    local: Arc<LocalCheckpoint>,
}

impl SessionHook {
    /// Builds the hook for one session.
    pub fn new(coordinator: Arc<CheckpointCoordinator>, local: Arc<LocalCheckpoint>) -> Self {
        Self { coordinator, local }
    }
}

impl GrowthObserver for SessionHook {
    fn on_growth(&self, frames: u64) {
        if self.local.threshold() > 0 {
            self.local.observe(frames);
        } else {
            self.coordinator.observe_growth(frames);
        }
    }
}

/// Optional process-wide mutex serialising statements marked by `.mutex_commit`.
#[derive(Debug, Default)]
pub struct CommitMutex {
    lock: Mutex<()>,
}

impl CommitMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the mutex and returns how long it was held.
    pub fn hold<T>(&self, clock: &dyn Clock, f: impl FnOnce() -> T) -> (T, Duration) {
        let _guard = self.lock.lock();
        let start = clock.now();
        let value = f();
        (value, clock.now().saturating_sub(start))
    }
}
