//! Error types for the store, migrator and audit pipeline.
//!
//! Library code returns these typed errors so callers can tell the recoverable
//! audit failures apart (timeouts, missing tool, malformed output). The binary
//! folds everything into `anyhow` at the top level.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid usage fact: {0}")]
    InvalidFact(String),

    #[error("Database connection lock poisoned")]
    Poisoned,

    #[error("Failed to (de)serialize stored payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration {version} ({description}) failed: {message}")]
    Failed {
        version: u32,
        description: String,
        message: String,
    },

    #[error("Invalid migration registry: {0}")]
    InvalidRegistry(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        MigrationError::Store(StoreError::Sqlite(err))
    }
}

/// Failures while acquiring authoritative usage from the external CLI.
#[derive(Error, Debug)]
pub enum ExternalError {
    #[error("Usage tool `{tool}` not found; install it or set audit.tool in the config")]
    ToolNotFound { tool: String },

    #[error("Usage tool call exceeded its time budget of {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("Usage tool returned malformed output: {excerpt:?}")]
    MalformedOutput { excerpt: String },

    #[error("Usage tool exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("Usage tool found no local usage history")]
    NoUsageHistory,

    #[error("Remote host {host} failed: {message}")]
    Transport { host: String, message: String },

    #[error("Failed to run usage tool: {0}")]
    Io(#[from] std::io::Error),
}

impl ExternalError {
    /// Timeouts are worth retrying or narrowing the date range.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExternalError::Timeout { .. })
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error(transparent)]
    External(#[from] ExternalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No local usage history and no remote hosts are configured")]
    NoRemotesConfigured,

    #[error("No local usage history and none of the {attempted} configured remote host(s) returned data")]
    RemotesEmpty { attempted: usize },

    #[error("Unknown remote host: {0}")]
    UnknownHost(String),

    #[error("Invalid audit period: {start} is after {end}")]
    InvalidPeriod {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },
}

impl From<rusqlite::Error> for AuditError {
    fn from(err: rusqlite::Error) -> Self {
        AuditError::Store(StoreError::Sqlite(err))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
