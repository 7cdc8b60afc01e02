//! Multi-client SQL load server.
//!
//! Clients connect over TCP, accumulate a batch of SQL statements, and run it
//! repeatedly against one shared database while the server coordinates
//! write-ahead-log checkpoints across every running client.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod logging;
pub mod server;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigFile, Overrides, ServerConfig};
pub use coordinator::{CheckpointCoordinator, CheckpointOutcome, CommitMutex, CoordinatorStats};
pub use engine::{EngineConnection, EngineError, GrowthObserver, StatementId, Store};
pub use engine::{SqliteStore, StoreOptions};
pub use error::{Result, ServerError};
pub use server::{Server, ServerContext, SessionOptions, Shutdown};
pub use session::{Session, SessionEnd, SessionState};
