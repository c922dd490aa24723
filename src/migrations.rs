//! Versioned schema migrations
//!
//! Every migration runs inside its own transaction together with its history
//! row and the `user_version` bump, so a migration is either fully applied or
//! not at all. A failure rolls back, records a `failed` history row outside the
//! transaction, and is re-raised; startup must stop there. Because the version
//! is left untouched the same migration is retried in full on the next run.
//!
//! ## Registered versions
//!
//! 1. `query_events` base table
//! 2. token counts, throughput and the legacy single-cost column
//! 3. dual-source cost columns and reconciliation metadata
//! 4. `audit_snapshots`

use crate::db::Database;
use crate::error::{MigrationError, StoreError};
use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub type MigrationFn = fn(&Transaction<'_>) -> rusqlite::Result<()>;

#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: MigrationFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Success,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Success => "success",
            MigrationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: u32,
    pub description: String,
    pub applied_at: i64,
    pub status: MigrationStatus,
    pub error_message: Option<String>,
}

/// What a call to [`SchemaMigrator::run_migrations`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
}

const HISTORY_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS _migrations (
        version       INTEGER PRIMARY KEY,
        description   TEXT NOT NULL,
        applied_at    INTEGER NOT NULL,
        status        TEXT NOT NULL CHECK (status IN ('success', 'failed')),
        error_message TEXT
    );
";

pub struct SchemaMigrator {
    migrations: Vec<Migration>,
}

impl Default for SchemaMigrator {
    fn default() -> Self {
        Self {
            migrations: registered_migrations(),
        }
    }
}

impl SchemaMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom migration list. Versions must be strictly ascending.
    pub fn with_migrations(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        for pair in migrations.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(MigrationError::InvalidRegistry(format!(
                    "version {} follows {}",
                    pair[1].version, pair[0].version
                )));
            }
        }
        if migrations.first().map(|m| m.version == 0).unwrap_or(false) {
            return Err(MigrationError::InvalidRegistry(
                "version 0 is reserved for an empty schema".to_string(),
            ));
        }
        Ok(Self { migrations })
    }

    /// Highest registered version.
    pub fn target_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    pub fn current_version(&self, db: &Database) -> Result<u32, StoreError> {
        db.with_conn(|conn| read_version(conn))
    }

    pub fn has_pending(&self, db: &Database) -> Result<bool, StoreError> {
        Ok(self.current_version(db)? < self.target_version())
    }

    /// Full attempt history, ordered by version.
    pub fn history(&self, db: &Database) -> Result<Vec<MigrationRecord>, StoreError> {
        db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '_migrations')",
                [],
                |row| row.get(0),
            )?;
            if !exists {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(
                "SELECT version, description, applied_at, status, error_message
                 FROM _migrations ORDER BY version ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (version, description, applied_at, status, error_message) = row?;
                let status = match status.as_str() {
                    "success" => MigrationStatus::Success,
                    "failed" => MigrationStatus::Failed,
                    other => {
                        return Err(StoreError::CorruptRow {
                            table: "_migrations",
                            message: format!("unknown status {other:?}"),
                        })
                    }
                };
                out.push(MigrationRecord {
                    version,
                    description,
                    applied_at,
                    status,
                    error_message,
                });
            }
            Ok(out)
        })
    }

    /// Apply every pending migration in ascending order.
    pub fn run_migrations(&self, db: &Database) -> Result<MigrationReport, MigrationError> {
        db.with_conn_mut(|conn| {
            conn.execute_batch(HISTORY_TABLE)?;
            let from_version = read_version(conn)?;
            let mut report = MigrationReport {
                from_version,
                to_version: from_version,
                applied: Vec::new(),
            };

            let pending: Vec<&Migration> = self
                .migrations
                .iter()
                .filter(|m| m.version > from_version)
                .collect();

            if pending.is_empty() {
                info!(version = from_version, "Schema is up to date");
                return Ok(report);
            }

            for migration in pending {
                match apply_one(conn, migration) {
                    Ok(()) => {
                        info!(
                            version = migration.version,
                            description = migration.description,
                            "Applied migration"
                        );
                        report.applied.push(migration.version);
                        report.to_version = migration.version;
                    }
                    Err(err) => {
                        let message = err.to_string();
                        error!(
                            version = migration.version,
                            description = migration.description,
                            error = %message,
                            "Migration failed; schema left at previous version"
                        );
                        record_attempt(
                            conn,
                            migration,
                            MigrationStatus::Failed,
                            Some(&message),
                        )?;
                        return Err(MigrationError::Failed {
                            version: migration.version,
                            description: migration.description.to_string(),
                            message,
                        });
                    }
                }
            }

            Ok(report)
        })
    }
}

fn apply_one(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    (migration.up)(&tx)?;
    record_attempt(&tx, migration, MigrationStatus::Success, None)?;
    tx.pragma_update(None, "user_version", migration.version)?;
    tx.commit()
}

fn record_attempt(
    conn: &Connection,
    migration: &Migration,
    status: MigrationStatus,
    error_message: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO _migrations (version, description, applied_at, status, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            migration.version,
            migration.description,
            Utc::now().timestamp_millis(),
            status.as_str(),
            error_message,
        ],
    )?;
    Ok(())
}

fn read_version(conn: &Connection) -> Result<u32, StoreError> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version.max(0) as u32)
}

pub fn registered_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Create query_events table",
            up: create_query_events,
        },
        Migration {
            version: 2,
            description: "Add token counts, throughput and legacy cost",
            up: add_token_columns,
        },
        Migration {
            version: 3,
            description: "Add dual-source cost and reconciliation metadata",
            up: add_dual_cost_columns,
        },
        Migration {
            version: 4,
            description: "Create audit_snapshots table",
            up: create_audit_snapshots,
        },
    ]
}

fn create_query_events(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE query_events (
            id           TEXT PRIMARY KEY,
            session_id   TEXT NOT NULL,
            agent_type   TEXT NOT NULL,
            source       TEXT NOT NULL CHECK (source IN ('user', 'auto')),
            start_time   INTEGER NOT NULL,
            duration     INTEGER NOT NULL CHECK (duration >= 0),
            project_path TEXT,
            is_remote    INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_query_events_start_time ON query_events(start_time);
        CREATE INDEX idx_query_events_agent_type ON query_events(agent_type);
        CREATE INDEX idx_query_events_source     ON query_events(source);
        CREATE INDEX idx_query_events_session    ON query_events(session_id);
        ",
    )
}

fn add_token_columns(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        ALTER TABLE query_events ADD COLUMN input_tokens INTEGER;
        ALTER TABLE query_events ADD COLUMN output_tokens INTEGER;
        ALTER TABLE query_events ADD COLUMN cache_read_tokens INTEGER;
        ALTER TABLE query_events ADD COLUMN cache_write_tokens INTEGER;
        ALTER TABLE query_events ADD COLUMN tokens_per_second REAL;
        ALTER TABLE query_events ADD COLUMN total_cost_usd REAL;
        ",
    )
}

fn add_dual_cost_columns(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        ALTER TABLE query_events ADD COLUMN external_cost REAL;
        ALTER TABLE query_events ADD COLUMN external_model TEXT;
        ALTER TABLE query_events ADD COLUMN local_cost REAL;
        ALTER TABLE query_events ADD COLUMN local_billing_mode TEXT;
        ALTER TABLE query_events ADD COLUMN local_pricing_model TEXT;
        ALTER TABLE query_events ADD COLUMN local_calculated_at INTEGER;
        ALTER TABLE query_events ADD COLUMN uuid TEXT;
        ALTER TABLE query_events ADD COLUMN external_message_id TEXT;
        ALTER TABLE query_events ADD COLUMN is_reconstructed INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE query_events ADD COLUMN reconstructed_at INTEGER;
        ALTER TABLE query_events ADD COLUMN external_session_id TEXT;

        CREATE INDEX idx_query_events_uuid ON query_events(uuid);
        ",
    )
}

fn create_audit_snapshots(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE audit_snapshots (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at            INTEGER NOT NULL,
            period_start          TEXT NOT NULL,
            period_end            TEXT NOT NULL,
            audit_type            TEXT NOT NULL
                CHECK (audit_type IN ('daily', 'weekly', 'monthly', 'manual')),
            local_input_tokens    INTEGER NOT NULL,
            local_output_tokens   INTEGER NOT NULL,
            local_cache_read_tokens  INTEGER NOT NULL,
            local_cache_write_tokens INTEGER NOT NULL,
            local_total_cost      REAL NOT NULL,
            external_input_tokens INTEGER NOT NULL,
            external_output_tokens INTEGER NOT NULL,
            external_cache_read_tokens  INTEGER NOT NULL,
            external_cache_write_tokens INTEGER NOT NULL,
            external_total_cost   REAL NOT NULL,
            token_discrepancy_pct REAL NOT NULL,
            cost_discrepancy_pct  REAL NOT NULL,
            entry_count           INTEGER NOT NULL,
            match_count           INTEGER NOT NULL,
            minor_count           INTEGER NOT NULL,
            major_count           INTEGER NOT NULL,
            missing_count         INTEGER NOT NULL,
            anomaly_count         INTEGER NOT NULL,
            payload               TEXT NOT NULL
        );

        CREATE INDEX idx_audit_snapshots_created ON audit_snapshots(created_at);
        CREATE INDEX idx_audit_snapshots_period  ON audit_snapshots(period_start, period_end);
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(db: &Database, name: &str) -> bool {
        db.with_conn(|c| {
            Ok(c.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |r| r.get::<_, i64>(0),
            )? > 0)
        })
        .unwrap()
    }

    #[test]
    fn test_registry_is_ascending() {
        let migrator = SchemaMigrator::with_migrations(registered_migrations()).unwrap();
        assert_eq!(migrator.target_version(), 4);
    }

    #[test]
    fn test_rejects_unordered_registry() {
        let mut list = registered_migrations();
        list.swap(0, 1);
        assert!(matches!(
            SchemaMigrator::with_migrations(list),
            Err(MigrationError::InvalidRegistry(_))
        ));
    }

    #[test]
    fn test_fresh_database_reaches_target() {
        let db = Database::open_in_memory().unwrap();
        let migrator = SchemaMigrator::new();
        assert!(migrator.has_pending(&db).unwrap());

        let report = migrator.run_migrations(&db).unwrap();
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, 4);
        assert_eq!(report.applied, vec![1, 2, 3, 4]);
        assert!(table_exists(&db, "query_events"));
        assert!(table_exists(&db, "audit_snapshots"));
        assert!(!migrator.has_pending(&db).unwrap());
    }

    #[test]
    fn test_history_records_success() {
        let db = Database::open_in_memory().unwrap();
        let migrator = SchemaMigrator::new();
        migrator.run_migrations(&db).unwrap();

        let history = migrator.history(&db).unwrap();
        assert_eq!(history.len(), 4);
        assert!(history
            .iter()
            .all(|r| r.status == MigrationStatus::Success && r.error_message.is_none()));
    }
}
