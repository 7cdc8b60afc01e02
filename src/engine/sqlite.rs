//! SQLite-backed store built on rusqlite.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::split::next_statement;
use super::{EngineConnection, EngineError, GrowthObserver, StatementId, Store};

const WAL_HEADER_LEN: u64 = 32;
const WAL_FRAME_HEADER_LEN: u64 = 24;
const STATEMENT_CACHE_CAPACITY: usize = 128;

/// SQLite journal modes accepted by the server.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-ahead logging; required for the growth hook to report anything.
    #[default]
    Wal,
    /// Rollback journal deleted at commit.
    Delete,
    /// Rollback journal truncated at commit.
    Truncate,
    /// Rollback journal header zeroed at commit.
    Persist,
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JournalMode::Wal => "wal",
            JournalMode::Delete => "delete",
            JournalMode::Truncate => "truncate",
            JournalMode::Persist => "persist",
        })
    }
}

impl FromStr for JournalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wal" => Ok(JournalMode::Wal),
            "delete" => Ok(JournalMode::Delete),
            "truncate" => Ok(JournalMode::Truncate),
            "persist" => Ok(JournalMode::Persist),
            other => Err(format!("unknown journal mode '{other}'")),
        }
    }
}

/// Options applied to every connection opened by a [`SqliteStore`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Journal mode set on the primary connection.
    pub journal_mode: JournalMode,
    /// How long SQLite retries internally before reporting `SQLITE_BUSY`.
    pub busy_timeout: Duration,
    /// Memory-mapped I/O size in bytes, if any.
    pub mmap_size: Option<u64>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout: Duration::ZERO,
            mmap_size: None,
        }
    }
}

/// A database file shared by all sessions.
///
/// Holds one primary connection for the lifetime of the store; `close`
/// drops it and flips the flag every session connection checks.
pub struct SqliteStore {
    path: PathBuf,
    options: StoreOptions,
    closed: Arc<AtomicBool>,
    primary: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, &options)?;
        let mode: String = conn
            .query_row(
                &format!("PRAGMA journal_mode={}", options.journal_mode),
                [],
                |row| row.get(0),
            )
            .map_err(map_err)?;
        debug!(path = %path.display(), journal_mode = %mode, "store.open");
        Ok(Self {
            path,
            options,
            closed: Arc::new(AtomicBool::new(false)),
            primary: Mutex::new(Some(conn)),
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Store for SqliteStore {
    fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let conn = open_connection(&self.path, &self.options)?;
        let conn = SqliteConnection::new(conn, &self.path, Arc::clone(&self.closed))?;
        Ok(Box::new(conn))
    }

    fn name(&self) -> &str {
        "main"
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(conn) = self.primary.lock().take() {
            if let Err((_, err)) = conn.close() {
                warn!(error = %err, "store.close.failed");
            }
        }
        debug!(path = %self.path.display(), "store.closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct Prepared {
    sql: String,
    readonly: bool,
    executed: bool,
    rows: VecDeque<Option<String>>,
    current: Option<String>,
}

/// One session's connection.
///
/// rusqlite statements borrow their connection, so statements are kept as
/// text and re-fetched from the connection's statement cache. The first
/// `step` after a reset runs the statement to completion and buffers the
/// first column of every row; later steps drain that buffer.
pub struct SqliteConnection {
    conn: Connection,
    wal_path: PathBuf,
    page_size: u64,
    closed: Arc<AtomicBool>,
    statements: HashMap<StatementId, Prepared>,
    next_id: u64,
    observer: Option<Arc<dyn GrowthObserver>>,
    dirty: bool,
}

impl SqliteConnection {
    fn new(conn: Connection, path: &Path, closed: Arc<AtomicBool>) -> Result<Self, EngineError> {
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .map_err(map_err)?;
        Ok(Self {
            conn,
            wal_path: wal_path(path),
            page_size: page_size.max(512) as u64,
            closed,
            statements: HashMap::new(),
            next_id: 1,
            observer: None,
            dirty: false,
        })
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn wal_frames(&self) -> u64 {
        match fs::metadata(&self.wal_path) {
            Ok(meta) => {
                meta.len().saturating_sub(WAL_HEADER_LEN) / (self.page_size + WAL_FRAME_HEADER_LEN)
            }
            Err(_) => 0,
        }
    }

    fn after_execute(&mut self, readonly: bool) {
        if !readonly {
            self.dirty = true;
        }
        if self.dirty && self.conn.is_autocommit() {
            self.dirty = false;
            if let Some(observer) = &self.observer {
                observer.on_growth(self.wal_frames());
            }
        }
    }
}

impl EngineConnection for SqliteConnection {
    fn prepare<'a>(
        &mut self,
        sql: &'a str,
    ) -> Result<(Option<StatementId>, &'a str), EngineError> {
        self.ensure_open()?;
        let Some((text, tail)) = next_statement(sql) else {
            return Ok((None, ""));
        };
        let readonly = {
            let stmt = self.conn.prepare_cached(text).map_err(map_err)?;
            stmt.readonly()
        };
        let id = StatementId(self.next_id);
        self.next_id += 1;
        self.statements.insert(
            id,
            Prepared {
                sql: text.to_string(),
                readonly,
                executed: false,
                rows: VecDeque::new(),
                current: None,
            },
        );
        Ok((Some(id), tail))
    }

    fn step(&mut self, id: StatementId) -> Result<bool, EngineError> {
        self.ensure_open()?;
        let (sql, readonly, executed) = match self.statements.get(&id) {
            Some(stmt) => (stmt.sql.clone(), stmt.readonly, stmt.executed),
            None => return Err(EngineError::Other(format!("unknown statement {id}"))),
        };
        if !executed {
            let rows = run_to_completion(&self.conn, &sql)?;
            self.after_execute(readonly);
            if let Some(stmt) = self.statements.get_mut(&id) {
                stmt.executed = true;
                stmt.rows = rows;
            }
        }
        let Some(stmt) = self.statements.get_mut(&id) else {
            return Ok(false);
        };
        match stmt.rows.pop_front() {
            Some(value) => {
                stmt.current = value;
                Ok(true)
            }
            None => {
                stmt.current = None;
                Ok(false)
            }
        }
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
        !self.conn.is_autocommit()
    }

    fn rollback(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.dirty = false;
        self.conn.execute_batch("ROLLBACK").map_err(map_err)
    }

    fn set_growth_observer(&mut self, observer: Arc<dyn GrowthObserver>) {
        self.observer = Some(observer);
    }

    fn checkpoint(&mut self, store_name: &str) -> Result<(), EngineError> {
        self.ensure_open()?;
        let sql = format!(
            "PRAGMA \"{}\".wal_checkpoint(TRUNCATE)",
            store_name.replace('"', "\"\"")
        );
        let (blocked, log, checkpointed): (i64, i64, i64) = self
            .conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(map_err)?;
        if blocked != 0 {
            return Err(EngineError::Busy(
                "checkpoint could not complete: database is busy".into(),
            ));
        }
        debug!(log, checkpointed, "store.checkpoint.done");
        Ok(())
    }
}

fn open_connection(path: &Path, options: &StoreOptions) -> Result<Connection, EngineError> {
    let conn = Connection::open(path).map_err(map_err)?;
    conn.busy_timeout(options.busy_timeout).map_err(map_err)?;
    // Checkpoints only run through the coordinator.
    apply_pragma(&conn, "PRAGMA wal_autocheckpoint=0")?;
    if let Some(size) = options.mmap_size {
        apply_pragma(&conn, &format!("PRAGMA mmap_size={size}"))?;
    }
    Ok(conn)
}

fn apply_pragma(conn: &Connection, sql: &str) -> Result<(), EngineError> {
    let mut stmt = conn.prepare(sql).map_err(map_err)?;
    let mut rows = stmt.query([]).map_err(map_err)?;
    while rows.next().map_err(map_err)?.is_some() {}
    Ok(())
}

fn run_to_completion(conn: &Connection, sql: &str) -> Result<VecDeque<Option<String>>, EngineError> {
    let mut stmt = conn.prepare_cached(sql).map_err(map_err)?;
    let has_columns = stmt.column_count() > 0;
    let mut rows = stmt.query([]).map_err(map_err)?;
    let mut values = VecDeque::new();
    while let Some(row) = rows.next().map_err(map_err)? {
        if has_columns {
            values.push_back(value_text(row.get_ref(0).map_err(map_err)?));
        } else {
            values.push_back(None);
        }
    }
    Ok(values)
}

fn value_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(v) => Some(v.to_string()),
        ValueRef::Real(v) => Some(v.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn map_err(err: rusqlite::Error) -> EngineError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy => EngineError::Busy(err.to_string()),
            ErrorCode::DatabaseLocked => EngineError::Locked(err.to_string()),
            _ => EngineError::Other(err.to_string()),
        },
        _ => EngineError::Other(err.to_string()),
    }
}

pub(crate) fn wal_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("tserver.db"));
    name.push("-wal");
    let mut output = path.to_path_buf();
    output.set_file_name(name);
    output
}
