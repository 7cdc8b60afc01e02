//! Client sessions: protocol state machine and run loop.
//!
//! A session owns a private engine connection and an ordered batch of
//! prepared statements. SQL input appends to the batch, dot-commands tune
//! the next run, and `.run` executes the batch repeatedly, coordinating
//! checkpoints with every other running session.

pub mod command;
pub mod input;
pub mod report;

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::coordinator::{CheckpointOutcome, LocalCheckpoint, RunningWriter, SessionHook};
use crate::engine::{EngineConnection, EngineError, StatementId};
use crate::error::{Result, ServerError};
use crate::server::ServerContext;

pub use command::{Command, CommandError};
pub use input::{Input, InputReader, DEFAULT_MAX_INPUT};
pub use report::{Progress, RunStats, RunSummary};

const INTEGRITY_CHECK_SQL: &str = "PRAGMA integrity_check";
const COMMIT_SQL: &str = "COMMIT";

/// Per-statement execution flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatementFlags {
    /// Execute while holding the process-wide commit mutex.
    pub requires_global_mutex: bool,
    /// Compare the first result row against `ok`.
    pub integrity_check: bool,
}

/// An entry of the session batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Engine handle.
    pub handle: StatementId,
    /// Execution flags.
    pub flags: StatementFlags,
}

/// Observable protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No accumulated statements.
    Idle,
    /// Statements accumulated, no run in progress.
    Accumulating,
    /// Inside `.run`.
    Running,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection.
    Disconnected,
    /// The client sent `.quit`.
    Quit,
    /// The server is stopping, by this session's `.stop` or another's.
    Stopped,
}

enum Flow {
    Continue,
    Quit,
    Stop,
}

/// One client connection's state.
pub struct Session {
    id: u64,
    ctx: Arc<ServerContext>,
    conn: Box<dyn EngineConnection>,
    batch: Vec<PreparedStatement>,
    repeats: Option<u32>,
    seconds: Option<u32>,
    local: Arc<LocalCheckpoint>,
    running: bool,
}

impl Session {
    /// Opens a connection to the shared store and installs the growth hook.
    pub fn open(ctx: Arc<ServerContext>, id: u64) -> Result<Self> {
        let mut conn = ctx.store.connect()?;
        let local = Arc::new(LocalCheckpoint::default());
        conn.set_growth_observer(Arc::new(SessionHook::new(
            Arc::clone(&ctx.coordinator),
            Arc::clone(&local),
        )));
        debug!(session = id, "session.open");
        Ok(Self {
            id,
            ctx,
            conn,
            batch: Vec::new(),
            repeats: None,
            seconds: None,
            local,
            running: false,
        })
    }

    /// Session identifier used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current protocol state.
    pub fn state(&self) -> SessionState {
        if self.running {
            SessionState::Running
        } else if self.batch.is_empty() {
            SessionState::Idle
        } else {
            SessionState::Accumulating
        }
    }

    /// Number of statements in the batch.
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Iteration bound for the next run, if any.
    pub fn repeats(&self) -> Option<u32> {
        self.repeats
    }

    /// Time bound in seconds for the next run, if any.
    pub fn seconds(&self) -> Option<u32> {
        self.seconds
    }

    /// This session's local checkpoint threshold; zero when in global mode.
    pub fn local_threshold(&self) -> u64 {
        self.local.threshold()
    }

    /// Reads input until the peer disconnects, quits or the server stops.
    ///
    /// Oversized input is reported to the client and then returned as an error.
    pub fn serve<R: Read, W: Write>(&mut self, reader: R, mut out: W) -> Result<SessionEnd> {
        let mut input = InputReader::new(reader, self.ctx.options.max_input_bytes);
        loop {
            let next = match input.next_input() {
                Ok(Some(next)) => next,
                Ok(None) => return Ok(SessionEnd::Disconnected),
                Err(err @ ServerError::Oversized { .. }) => {
                    writeln!(out, "error - {err}")?;
                    out.flush()?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            if self.ctx.shutdown.is_triggered() {
                writeln!(out, "error - server is stopping")?;
                out.flush()?;
                return Ok(SessionEnd::Stopped);
            }
            let flow = match next {
                Input::Sql(sql) => {
                    self.append_sql(&sql, &mut out)?;
                    Flow::Continue
                }
                Input::Command(line) => match command::parse(&line) {
                    Ok(command) => self.execute(command, &mut out)?,
                    Err(err) => {
                        writeln!(out, "error - {err}")?;
                        Flow::Continue
                    }
                },
            };
            out.flush()?;
            match flow {
                Flow::Continue => {}
                Flow::Quit => return Ok(SessionEnd::Quit),
                Flow::Stop => return Ok(SessionEnd::Stopped),
            }
        }
    }

    fn append_sql<W: Write>(&mut self, sql: &str, out: &mut W) -> Result<()> {
        let mut pending = Vec::new();
        let mut rest = sql;
        loop {
            match self.conn.prepare(rest) {
                Ok((Some(handle), tail)) => {
                    pending.push(PreparedStatement {
                        handle,
                        flags: StatementFlags::default(),
                    });
                    rest = tail;
                }
                Ok((None, _)) => break,
                Err(err) => {
                    for stmt in pending {
                        self.conn.finalize(stmt.handle);
                    }
                    writeln!(out, "error - {err}")?;
                    return Ok(());
                }
            }
        }
        self.batch.extend(pending);
        Ok(())
    }

    fn append_flagged<W: Write>(&mut self, sql: &str, flags: StatementFlags, out: &mut W) -> Result<()> {
        match self.conn.prepare(sql) {
            Ok((Some(handle), _)) => self.batch.push(PreparedStatement { handle, flags }),
            Ok((None, _)) => {}
            Err(err) => writeln!(out, "error - {err}")?,
        }
        Ok(())
    }

    fn execute<W: Write>(&mut self, command: Command, out: &mut W) -> Result<Flow> {
        match command {
            Command::List => {
                for stmt in &self.batch {
                    writeln!(out, "{}", self.conn.sql(stmt.handle).unwrap_or("").trim())?;
                }
            }
            Command::Quit => return Ok(Flow::Quit),
            Command::Repeats(n) => {
                if n > 0 {
                    self.repeats = Some(clamp_u32(n));
                    self.seconds = None;
                } else {
                    self.repeats = None;
                }
            }
            Command::Seconds(n) => {
                if n > 0 {
                    self.seconds = Some(clamp_u32(n));
                    self.repeats = None;
                } else {
                    self.seconds = None;
                }
            }
            Command::MutexCommit => {
                let flags = StatementFlags {
                    requires_global_mutex: true,
                    ..StatementFlags::default()
                };
                self.append_flagged(COMMIT_SQL, flags, out)?;
            }
            Command::IntegrityCheck => {
                let flags = StatementFlags {
                    integrity_check: true,
                    ..StatementFlags::default()
                };
                self.append_flagged(INTEGRITY_CHECK_SQL, flags, out)?;
            }
            Command::Checkpoint(n) => {
                self.local.set_threshold(n.max(0) as u64);
            }
            Command::Stop => {
                info!(session = self.id, "session.stop");
                self.ctx.stop();
                return Ok(Flow::Stop);
            }
            Command::Run => self.run(out)?,
        }
        Ok(Flow::Continue)
    }

    fn run<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let writer = ctx.coordinator.enter();
        self.running = true;
        info!(
            session = self.id,
            statements = self.batch.len(),
            repeats = ?self.repeats,
            seconds = ?self.seconds,
            "session.run.start"
        );
        let result = self.run_loop(&writer, out);
        self.clear_batch();
        self.running = false;
        drop(writer);
        let stats = result?;
        info!(
            session = self.id,
            attempted = stats.attempted,
            busy = stats.busy,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "session.run.done"
        );
        writeln!(out, "{}", report::summary_line(&stats))?;
        if self.is_unbounded() {
            writeln!(out, "{}", report::machine_summary_line(&stats))?;
        }
        Ok(())
    }

    fn is_unbounded(&self) -> bool {
        self.repeats.is_none() && self.seconds.is_none()
    }

    fn run_loop<W: Write>(&mut self, writer: &RunningWriter<'_>, out: &mut W) -> Result<RunStats> {
        let ctx = Arc::clone(&self.ctx);
        let clock = ctx.clock.as_ref();
        let start = clock.now();
        let deadline = self.seconds.map(|s| Duration::from_secs(u64::from(s)));
        let machine = self.is_unbounded();
        let mut progress = Progress::new(start);
        let mut stats = RunStats::default();
        loop {
            if let Some(repeats) = self.repeats {
                if stats.attempted >= u64::from(repeats) {
                    break;
                }
            }
            if let Some(limit) = deadline {
                if clock.now().saturating_sub(start) >= limit {
                    break;
                }
            }
            if ctx.shutdown.is_triggered() {
                debug!(session = self.id, "session.run.interrupted");
                break;
            }
            stats.attempted += 1;
            if self.run_iteration(&mut stats, out)? {
                stats.busy += 1;
            } else {
                stats.successful += 1;
            }
            if let Some(line) = progress.tick(clock.now(), ctx.options.progress_interval, &stats, machine) {
                writeln!(out, "{line}")?;
                out.flush()?;
            }
            self.settle_checkpoints(writer, &mut stats, out)?;
        }
        stats.elapsed = clock.now().saturating_sub(start);
        Ok(stats)
    }

    /// Executes the batch once. Returns true if the iteration hit a busy/locked error.
    fn run_iteration<W: Write>(&mut self, stats: &mut RunStats, out: &mut W) -> Result<bool> {
        let ctx = Arc::clone(&self.ctx);
        for index in 0..self.batch.len() {
            let stmt = self.batch[index];
            let conn = self.conn.as_mut();
            let result = if stmt.flags.requires_global_mutex {
                let (result, held) = ctx
                    .commit_mutex
                    .hold(ctx.clock.as_ref(), || execute_statement(conn, stmt.handle));
                stats.commit_time += held;
                result
            } else {
                execute_statement(conn, stmt.handle)
            };
            match result {
                Ok(first) => {
                    if stmt.flags.integrity_check && first.as_deref() != Some("ok") {
                        writeln!(
                            out,
                            "error - integrity_check: {}",
                            first.as_deref().unwrap_or("(no result)")
                        )?;
                    }
                }
                Err(err) if err.is_transient() => {
                    if self.conn.in_transaction() {
                        if let Err(rollback_err) = self.conn.rollback() {
                            debug!(session = self.id, error = %rollback_err, "session.rollback.failed");
                        }
                    }
                    debug!(session = self.id, error = %err, "session.run.busy");
                    return Ok(true);
                }
                Err(err) => writeln!(out, "error - {err}")?,
            }
        }
        Ok(false)
    }

    fn settle_checkpoints<W: Write>(
        &mut self,
        writer: &RunningWriter<'_>,
        stats: &mut RunStats,
        out: &mut W,
    ) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let store_name = ctx.store.name();
        if self.local.is_required() {
            match self.conn.checkpoint(store_name) {
                Ok(()) => {
                    self.local.clear();
                    stats.checkpoints += 1;
                    debug!(session = self.id, "session.checkpoint.local");
                }
                Err(err) if err.is_transient() => {
                    debug!(session = self.id, error = %err, "session.checkpoint.local_busy");
                }
                Err(EngineError::Closed) => {
                    debug!(session = self.id, "session.checkpoint.store_closed");
                }
                Err(err) => {
                    error!(session = self.id, error = %err, "session.checkpoint.local_failed");
                    debug_assert!(err.is_transient(), "local checkpoint failed: {err}");
                    self.local.clear();
                    writeln!(out, "error - checkpoint failed: {err}")?;
                }
            }
        }
        let conn = self.conn.as_mut();
        match ctx
            .coordinator
            .maybe_checkpoint(writer, || conn.checkpoint(store_name))
        {
            CheckpointOutcome::Performed => stats.checkpoints += 1,
            // The store closes under running sessions once `.stop` arrives.
            CheckpointOutcome::Failed(EngineError::Closed) => {
                debug!(session = self.id, "session.checkpoint.store_closed");
            }
            CheckpointOutcome::Failed(err) => {
                debug_assert!(err.is_transient(), "global checkpoint failed: {err}");
                writeln!(out, "error - checkpoint failed: {err}")?;
            }
            CheckpointOutcome::NotRequired | CheckpointOutcome::Busy | CheckpointOutcome::Waited => {}
        }
        Ok(())
    }

    fn clear_batch(&mut self) {
        for stmt in self.batch.drain(..) {
            self.conn.finalize(stmt.handle);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.clear_batch();
        debug!(session = self.id, "session.closed");
    }
}

/// Steps a statement until it yields no more rows, then resets it.
///
/// Returns the first column of the first row, if any.
fn execute_statement(
    conn: &mut dyn EngineConnection,
    handle: StatementId,
) -> std::result::Result<Option<String>, EngineError> {
    let mut first = None;
    let mut rows = 0u64;
    let stepped = loop {
        match conn.step(handle) {
            Ok(true) => {
                if rows == 0 {
                    first = conn.column_text(handle, 0);
                }
                rows += 1;
            }
            Ok(false) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    let reset = conn.reset(handle);
    stepped?;
    reset?;
    Ok(first)
}

fn clamp_u32(n: i64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
