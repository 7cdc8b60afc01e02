//! In-memory engine used by the integration tests.
//!
//! `FakeStore` mimics the parts of a WAL database the server relies on: each
//! committed write adds frames to a shared log, the growth observer is told
//! the new size, and `checkpoint` resets the log. Individual executions can be
//! made to fail with a busy error, and the store records enough counters to
//! check the barrier's guarantees.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tserver::engine::split::next_statement;
use tserver::{
    EngineConnection, EngineError, GrowthObserver, ManualClock, ServerContext, Session,
    SessionEnd, StatementId, Store,
};

/// Shared state behind every connection of one fake store.
#[derive(Default)]
pub struct FakeState {
    closed: AtomicBool,
    frames: AtomicU64,
    frames_per_commit: AtomicU64,
    checkpoint_calls: AtomicU64,
    busy_checkpoints: AtomicU64,
    in_checkpoint: AtomicBool,
    overlaps: AtomicU64,
    rollbacks: AtomicU64,
    close_on_commit: AtomicBool,
    checkpoint_delay: Mutex<Duration>,
    integrity_result: Mutex<String>,
    executions: Mutex<HashMap<String, u64>>,
    busy_on: Mutex<HashMap<String, HashSet<u64>>>,
    clock: Mutex<Option<(Arc<ManualClock>, Duration)>>,
}

/// A `Store` whose connections keep everything in memory.
#[derive(Clone)]
pub struct FakeStore {
    state: Arc<FakeState>,
}

impl FakeStore {
    pub fn new() -> Self {
        let state = FakeState::default();
        state.frames_per_commit.store(1, Ordering::SeqCst);
        *state.integrity_result.lock() = "ok".to_string();
        Self {
            state: Arc::new(state),
        }
    }

    pub fn frames_per_commit(self, frames: u64) -> Self {
        self.state.frames_per_commit.store(frames, Ordering::SeqCst);
        self
    }

    pub fn checkpoint_delay(self, delay: Duration) -> Self {
        *self.state.checkpoint_delay.lock() = delay;
        self
    }

    /// Closes the store right after the first commit reports its growth.
    pub fn close_on_commit(self) -> Self {
        self.state.close_on_commit.store(true, Ordering::SeqCst);
        self
    }

    /// Advances `clock` by `tick` on every statement execution.
    pub fn with_clock(self, clock: Arc<ManualClock>, tick: Duration) -> Self {
        *self.state.clock.lock() = Some((clock, tick));
        self
    }

    pub fn set_integrity_result(&self, result: &str) {
        *self.state.integrity_result.lock() = result.to_string();
    }

    /// Makes the `nth` (1-based, across all connections) execution of `sql` fail with busy.
    pub fn busy_on(&self, sql: &str, nth: u64) {
        self.state
            .busy_on
            .lock()
            .entry(sql.to_string())
            .or_default()
            .insert(nth);
    }

    /// Makes the next `count` checkpoints report busy.
    pub fn busy_checkpoints(&self, count: u64) {
        self.state.busy_checkpoints.store(count, Ordering::SeqCst);
    }

    pub fn executions(&self, sql: &str) -> u64 {
        self.state.executions.lock().get(sql).copied().unwrap_or(0)
    }

    pub fn frames(&self) -> u64 {
        self.state.frames.load(Ordering::SeqCst)
    }

    pub fn checkpoint_calls(&self) -> u64 {
        self.state.checkpoint_calls.load(Ordering::SeqCst)
    }

    /// Statements executed while a checkpoint was in progress.
    pub fn overlaps(&self) -> u64 {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }
}

impl Store for FakeStore {
    fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(Box::new(FakeConnection {
            state: Arc::clone(&self.state),
            observer: None,
            statements: HashMap::new(),
            next_id: 1,
            in_transaction: false,
            wrote: false,
        }))
    }

    fn name(&self) -> &str {
        "main"
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

struct FakeStatement {
    sql: String,
    executed: bool,
    rows: VecDeque<String>,
    current: Option<String>,
}

pub struct FakeConnection {
    state: Arc<FakeState>,
    observer: Option<Arc<dyn GrowthObserver>>,
    statements: HashMap<StatementId, FakeStatement>,
    next_id: u64,
    in_transaction: bool,
    wrote: bool,
}

impl FakeConnection {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.state.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn commit_growth(&mut self) {
        if !self.wrote {
            return;
        }
        self.wrote = false;
        let added = self.state.frames_per_commit.load(Ordering::SeqCst);
        let frames = self.state.frames.fetch_add(added, Ordering::SeqCst) + added;
        if let Some(observer) = &self.observer {
            observer.on_growth(frames);
        }
        if self.state.close_on_commit.load(Ordering::SeqCst) {
            self.state.closed.store(true, Ordering::SeqCst);
        }
    }

    fn execute(&mut self, sql: &str) -> Result<VecDeque<String>, EngineError> {
        let nth = {
            let mut executions = self.state.executions.lock();
            let count = executions.entry(sql.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if self.state.in_checkpoint.load(Ordering::SeqCst) {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if let Some((clock, tick)) = self.state.clock.lock().as_ref() {
            clock.advance(*tick);
        }
        let busy = self
            .state
            .busy_on
            .lock()
            .get(sql)
            .is_some_and(|set| set.contains(&nth));
        if busy {
            return Err(EngineError::Busy("database is locked".into()));
        }

        let upper = sql.to_ascii_uppercase();
        let verb = upper.split_whitespace().next().unwrap_or("");
        let mut rows = VecDeque::new();
        match verb {
            "BEGIN" => {
                if self.in_transaction {
                    return Err(EngineError::Other(
                        "cannot start a transaction within a transaction".into(),
                    ));
                }
                self.in_transaction = true;
            }
            "COMMIT" | "END" => {
                if !self.in_transaction {
                    return Err(EngineError::Other(
                        "cannot commit - no transaction is active".into(),
                    ));
                }
                self.in_transaction = false;
                self.commit_growth();
            }
            "ROLLBACK" => {
                self.in_transaction = false;
                self.wrote = false;
            }
            "PRAGMA" if upper.contains("INTEGRITY_CHECK") => {
                rows.push_back(self.state.integrity_result.lock().clone());
            }
            "SELECT" => rows.push_back("1".to_string()),
            _ => {
                self.wrote = true;
                if !self.in_transaction {
                    self.commit_growth();
                }
            }
        }
        Ok(rows)
    }
}

impl EngineConnection for FakeConnection {
    fn prepare<'a>(
        &mut self,
        sql: &'a str,
    ) -> Result<(Option<StatementId>, &'a str), EngineError> {
        self.ensure_open()?;
        let Some((text, tail)) = next_statement(sql) else {
            return Ok((None, ""));
        };
        if text.to_ascii_uppercase().contains("BOGUS") {
            return Err(EngineError::Other("near \"BOGUS\": syntax error".into()));
        }
        let id = StatementId(self.next_id);
        self.next_id += 1;
        self.statements.insert(
            id,
            FakeStatement {
                sql: text.to_string(),
                executed: false,
                rows: VecDeque::new(),
                current: None,
            },
        );
        Ok((Some(id), tail))
    }

    fn step(&mut self, id: StatementId) -> Result<bool, EngineError> {
        self.ensure_open()?;
        let (sql, executed) = match self.statements.get(&id) {
            Some(stmt) => (stmt.sql.clone(), stmt.executed),
            None => return Err(EngineError::Other(format!("unknown statement {id}"))),
        };
        if !executed {
            let rows = self.execute(&sql)?;
            if let Some(stmt) = self.statements.get_mut(&id) {
                stmt.executed = true;
                stmt.rows = rows;
            }
        }
        let Some(stmt) = self.statements.get_mut(&id) else {
            return Ok(false);
        };
        stmt.current = stmt.rows.pop_front();
        Ok(stmt.current.is_some())
    }

    fn column_text(&self, id: StatementId, col: usize) -> Option<String> {
        if col != 0 {
            return None;
        }
        self.statements.get(&id).and_then(|stmt| stmt.current.clone())
    }

    fn reset(&mut self, id: StatementId) -> Result<(), EngineError> {
        if let Some(stmt) = self.statements.get_mut(&id) {
            stmt.executed = false;
            stmt.rows.clear();
            stmt.current = None;
        }
        Ok(())
    }

    fn finalize(&mut self, id: StatementId) {
        self.statements.remove(&id);
    }

    fn sql(&self, id: StatementId) -> Option<&str> {
        self.statements.get(&id).map(|stmt| stmt.sql.as_str())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn rollback(&mut self) -> Result<(), EngineError> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = false;
        self.wrote = false;
        Ok(())
    }

    fn set_growth_observer(&mut self, observer: Arc<dyn GrowthObserver>) {
        self.observer = Some(observer);
    }

    fn checkpoint(&mut self, _store_name: &str) -> Result<(), EngineError> {
        self.ensure_open()?;
        assert!(
            !self.state.in_checkpoint.swap(true, Ordering::SeqCst),
            "checkpoints overlapped"
        );
        let delay = *self.state.checkpoint_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.state.checkpoint_calls.fetch_add(1, Ordering::SeqCst);
        let busy = self
            .state
            .busy_checkpoints
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !busy {
            self.state.frames.store(0, Ordering::SeqCst);
        }
        self.state.in_checkpoint.store(false, Ordering::SeqCst);
        if busy {
            Err(EngineError::Busy("checkpoint could not complete".into()))
        } else {
            Ok(())
        }
    }
}

/// Runs one session over `input` and returns how it ended plus its output lines.
pub fn run_session(ctx: &Arc<ServerContext>, id: u64, input: &str) -> (SessionEnd, Vec<String>) {
    let mut session = Session::open(Arc::clone(ctx), id).expect("open session");
    let mut out = Vec::new();
    let end = session
        .serve(input.as_bytes(), &mut out)
        .expect("session failed");
    (end, lines(&out))
}

pub fn lines(out: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(out)
        .lines()
        .map(str::to_string)
        .collect()
}

/// Writer that can be read from another thread while a session is running.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn lines(&self) -> Vec<String> {
        lines(&self.0.lock())
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Polls `condition` until it holds or a few seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
