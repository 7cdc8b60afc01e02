//! Server configuration: a TOML file overlaid by command-line flags.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::sqlite::JournalMode;
use crate::engine::StoreOptions;
use crate::server::SessionOptions;
use crate::session::DEFAULT_MAX_INPUT;

/// Port used when neither the file nor the command line names one.
pub const DEFAULT_PORT: u16 = 9999;

const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: IpAddr,
    /// Listen port.
    pub port: u16,
    /// Database file shared by all sessions.
    pub database: PathBuf,
    /// Connection options for the store.
    pub store: StoreOptions,
    /// Global checkpoint threshold in WAL frames; zero disables global mode.
    pub wal_threshold: u64,
    /// Session tunables.
    pub session: SessionOptions,
}

/// Values supplied on the command line; each one wins over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    /// Database path.
    pub database: Option<PathBuf>,
    /// Listen address.
    pub bind: Option<IpAddr>,
    /// Listen port.
    pub port: Option<u16>,
    /// Global checkpoint threshold.
    pub wal_threshold: Option<u64>,
    /// Journal mode.
    pub journal_mode: Option<JournalMode>,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: Option<u64>,
    /// mmap size in bytes.
    pub mmap_size: Option<u64>,
}

/// A loaded (possibly empty) configuration file.
#[derive(Debug, Default)]
pub struct ConfigFile {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl ConfigFile {
    /// Loads `explicit`, or the default location when `None`.
    ///
    /// A missing explicit file is an error; a missing default file yields an
    /// empty configuration.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound { path });
                }
                let data = read_file(&path)?;
                Ok(Self {
                    path: Some(path),
                    data,
                })
            }
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    let data = read_file(&path)?;
                    Ok(Self {
                        path: Some(path),
                        data,
                    })
                }
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parses configuration text directly.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let data = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(Self { path: None, data })
    }

    /// Path the configuration was read from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Merges the file with command-line overrides.
    pub fn resolve(&self, overrides: &Overrides) -> Result<ServerConfig, ConfigError> {
        let database = overrides
            .database
            .clone()
            .or_else(|| self.data.store.path.clone())
            .ok_or(ConfigError::MissingDatabase)?;
        let max_input_bytes = self
            .data
            .session
            .max_input_bytes
            .unwrap_or(DEFAULT_MAX_INPUT);
        if max_input_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "session.max_input_bytes",
                value: "0".into(),
            });
        }
        let progress_ms = self
            .data
            .session
            .progress_interval_ms
            .unwrap_or(DEFAULT_PROGRESS_INTERVAL_MS);
        if progress_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "session.progress_interval_ms",
                value: "0".into(),
            });
        }
        let busy_timeout_ms = overrides
            .busy_timeout_ms
            .or(self.data.store.busy_timeout_ms)
            .unwrap_or(0);
        Ok(ServerConfig {
            bind: overrides
                .bind
                .or(self.data.server.bind)
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: overrides
                .port
                .or(self.data.server.port)
                .unwrap_or(DEFAULT_PORT),
            database,
            store: StoreOptions {
                journal_mode: overrides
                    .journal_mode
                    .or(self.data.store.journal_mode)
                    .unwrap_or_default(),
                busy_timeout: Duration::from_millis(busy_timeout_ms),
                mmap_size: overrides.mmap_size.or(self.data.store.mmap_size),
            },
            wal_threshold: overrides
                .wal_threshold
                .or(self.data.checkpoint.wal_threshold)
                .unwrap_or(0),
            session: SessionOptions {
                max_input_bytes,
                progress_interval: Duration::from_millis(progress_ms),
            },
        })
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    store: StoreSection,
    #[serde(default)]
    checkpoint: CheckpointSection,
    #[serde(default)]
    session: SessionSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    bind: Option<IpAddr>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct StoreSection {
    path: Option<PathBuf>,
    journal_mode: Option<JournalMode>,
    busy_timeout_ms: Option<u64>,
    mmap_size: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct CheckpointSection {
    wal_threshold: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct SessionSection {
    max_input_bytes: Option<usize>,
    progress_interval_ms: Option<u64>,
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("config file {path} not found")]
    NotFound {
        /// Requested path.
        path: PathBuf,
    },
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
    /// No database path in the file or on the command line.
    #[error("no database given; pass DATABASE or set [store] path")]
    MissingDatabase,
    /// A value is out of range.
    #[error("invalid value '{value}' for {field}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Default config location, `<config dir>/tserver/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("tserver").join("config.toml"))
}
