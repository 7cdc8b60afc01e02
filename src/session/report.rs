//! Response lines emitted by the run loop.

use std::time::Duration;

use serde::Serialize;

/// Prefix of lines meant for machine consumption.
pub const MACHINE_PREFIX: &str = "### ";

/// Counters accumulated over one `.run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Iterations that completed without a busy/locked error.
    pub successful: u64,
    /// Iterations started.
    pub attempted: u64,
    /// Iterations abandoned because of a busy/locked error.
    pub busy: u64,
    /// Time spent holding the commit mutex.
    pub commit_time: Duration,
    /// Checkpoints this session performed.
    pub checkpoints: u64,
    /// Wall time of the whole run.
    pub elapsed: Duration,
}

/// Machine-readable summary written after an unbounded run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Successful iterations.
    pub iterations: u64,
    /// Attempted iterations.
    pub attempted: u64,
    /// Busy iterations.
    pub busy: u64,
    /// Run duration in milliseconds.
    pub elapsed_ms: u64,
    /// Time inside the commit mutex in milliseconds.
    pub commit_ms: u64,
    /// Checkpoints performed by this session.
    pub checkpoints: u64,
}

impl From<&RunStats> for RunSummary {
    fn from(stats: &RunStats) -> Self {
        Self {
            iterations: stats.successful,
            attempted: stats.attempted,
            busy: stats.busy,
            elapsed_ms: stats.elapsed.as_millis() as u64,
            commit_ms: stats.commit_time.as_millis() as u64,
            checkpoints: stats.checkpoints,
        }
    }
}

/// Final line of every run.
pub fn summary_line(stats: &RunStats) -> String {
    format!("ok {}/{} SQLITE_BUSY", stats.successful, stats.attempted)
}

/// Machine summary line for unbounded runs.
pub fn machine_summary_line(stats: &RunStats) -> String {
    let summary = RunSummary::from(stats);
    let json = serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string());
    format!("{MACHINE_PREFIX}{json}")
}

/// Tracks the window between progress lines.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    at: Duration,
    attempted: u64,
    busy: u64,
    commit_time: Duration,
}

impl Progress {
    /// Starts the first window at `now`.
    pub fn new(now: Duration) -> Self {
        Self {
            at: now,
            attempted: 0,
            busy: 0,
            commit_time: Duration::ZERO,
        }
    }

    /// Returns a progress line if at least `interval` passed since the last one.
    ///
    /// The rate only counts time outside the commit mutex; the mutex time is
    /// reported on its own.
    pub fn tick(
        &mut self,
        now: Duration,
        interval: Duration,
        stats: &RunStats,
        machine: bool,
    ) -> Option<String> {
        let window = now.saturating_sub(self.at);
        if window < interval {
            return None;
        }
        let commit = stats.commit_time.saturating_sub(self.commit_time);
        let active = window.saturating_sub(commit);
        let done = stats.attempted - self.attempted;
        let rate = if active.is_zero() {
            0
        } else {
            (done as f64 / active.as_secs_f64()).round() as u64
        };
        let line = format!(
            "{}({} done @ {} per second, {} busy, {} ms in commit mutex)",
            if machine { MACHINE_PREFIX } else { "" },
            stats.attempted,
            rate,
            stats.busy - self.busy,
            commit.as_millis()
        );
        *self = Self {
            at: now,
            attempted: stats.attempted,
            busy: stats.busy,
            commit_time: stats.commit_time,
        };
        Some(line)
    }
}
