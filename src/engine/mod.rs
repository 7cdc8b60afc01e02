//! Narrow interfaces to the statement and storage engines.
//!
//! Sessions never talk to a database library directly. They hold a
//! [`EngineConnection`] obtained from a process-wide [`Store`], prepare
//! statements through it, step them to completion and ask it to checkpoint.
//! The storage side pushes write growth back through a [`GrowthObserver`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub mod split;
pub mod sqlite;

pub use sqlite::{SqliteConnection, SqliteStore, StoreOptions};

/// Opaque handle to a prepared statement owned by one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(pub u64);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt#{}", self.0)
    }
}

/// Classified engine failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Another connection holds a conflicting lock; retry later.
    #[error("{0}")]
    Busy(String),
    /// A table in the same process is locked; retry later.
    #[error("{0}")]
    Locked(String),
    /// The shared store has been closed by `.stop`.
    #[error("store is closed")]
    Closed,
    /// Any other failure, carrying the engine's message.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Returns true for lock contention that should be retried rather than reported.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Busy(_) | EngineError::Locked(_))
    }
}

/// Receives the write-growth metric after each commit.
pub trait GrowthObserver: Send + Sync {
    /// Called with the current size of the write-ahead log in frames.
    fn on_growth(&self, frames: u64);
}

/// A private session handle into the statement and storage engines.
pub trait EngineConnection: Send {
    /// Compiles the first complete statement in `sql`.
    ///
    /// Returns `None` for the handle when only whitespace or comments remain,
    /// together with the unconsumed tail of the input.
    fn prepare<'a>(&mut self, sql: &'a str)
        -> Result<(Option<StatementId>, &'a str), EngineError>;

    /// Advances the statement; `true` means a row is available.
    fn step(&mut self, id: StatementId) -> Result<bool, EngineError>;

    /// Text of column `col` in the current row, if any.
    fn column_text(&self, id: StatementId, col: usize) -> Option<String>;

    /// Rewinds the statement so it can be stepped again.
    fn reset(&mut self, id: StatementId) -> Result<(), EngineError>;

    /// Releases the statement.
    fn finalize(&mut self, id: StatementId);

    /// Original text of a prepared statement.
    fn sql(&self, id: StatementId) -> Option<&str>;

    /// Whether an explicit transaction is open on this connection.
    fn in_transaction(&self) -> bool;

    /// Rolls back the open transaction.
    fn rollback(&mut self) -> Result<(), EngineError>;

    /// Installs the observer notified after each write commit.
    fn set_growth_observer(&mut self, observer: Arc<dyn GrowthObserver>);

    /// Checkpoints the write-ahead log of `store_name` (for SQLite, the schema name).
    fn checkpoint(&mut self, store_name: &str) -> Result<(), EngineError>;
}

/// The process-wide durable store that hands out session connections.
pub trait Store: Send + Sync {
    /// Opens a new private connection.
    fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError>;

    /// Name passed to [`EngineConnection::checkpoint`].
    fn name(&self) -> &str;

    /// Closes the store. Every connection fails with [`EngineError::Closed`] afterwards.
    fn close(&self);

    /// Whether [`Store::close`] has been called.
    fn is_closed(&self) -> bool;
}
