//! Binary entry point for the SQL load server.
#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tserver::config::{ConfigFile, Overrides};
use tserver::engine::sqlite::JournalMode;
use tserver::logging::{init_logging, DEFAULT_FILTER};
use tserver::{Result, Server, ServerContext, SqliteStore};

#[derive(Parser, Debug)]
#[command(
    name = "tserver",
    version,
    about = "Multi-client SQL load server with coordinated WAL checkpoints"
)]
struct Cli {
    #[arg(value_name = "DATABASE", help = "Database file shared by all clients")]
    database: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        env = "TSERVER_CONFIG",
        help = "Configuration file (defaults to the user config directory)"
    )]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", help = "Listen address")]
    bind: Option<IpAddr>,

    #[arg(long, value_name = "PORT", help = "Listen port [default: 9999]")]
    port: Option<u16>,

    #[arg(
        long,
        value_name = "FRAMES",
        help = "Global checkpoint threshold in WAL frames; 0 disables global mode"
    )]
    wal_threshold: Option<u64>,

    #[arg(long, value_enum, help = "Journal mode applied when the database is opened")]
    journal_mode: Option<JournalModeArg>,

    #[arg(long, value_name = "MS", help = "Busy timeout for each connection")]
    busy_timeout_ms: Option<u64>,

    #[arg(long, value_name = "BYTES", help = "mmap size for each connection")]
    mmap_size: Option<u64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum JournalModeArg {
    Wal,
    Delete,
    Truncate,
    Persist,
}

impl From<JournalModeArg> for JournalMode {
    fn from(mode: JournalModeArg) -> Self {
        match mode {
            JournalModeArg::Wal => JournalMode::Wal,
            JournalModeArg::Delete => JournalMode::Delete,
            JournalModeArg::Truncate => JournalMode::Truncate,
            JournalModeArg::Persist => JournalMode::Persist,
        }
    }
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            database: self.database.clone(),
            bind: self.bind,
            port: self.port,
            wal_threshold: self.wal_threshold,
            journal_mode: self.journal_mode.map(Into::into),
            busy_timeout_ms: self.busy_timeout_ms,
            mmap_size: self.mmap_size,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        process::exit(1);
    }
    // Session threads may still be blocked on their sockets after `.stop`.
    process::exit(0);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(DEFAULT_FILTER)?;

    let file = ConfigFile::load(cli.config.clone())?;
    let config = file.resolve(&cli.overrides())?;
    info!(
        config = ?file.path(),
        database = %config.database.display(),
        journal_mode = %config.store.journal_mode,
        wal_threshold = config.wal_threshold,
        "tserver.start"
    );

    let store = SqliteStore::open(&config.database, config.store.clone())?;
    let ctx = ServerContext::new(Arc::new(store), config.wal_threshold)
        .with_options(config.session.clone());
    let server = Server::bind((config.bind, config.port), Arc::new(ctx))?;
    server.serve()?;
    Ok(())
}
