//! SQLite handle owned by the composition root.
//!
//! There is exactly one [`Database`] per process. It is constructed explicitly
//! (usually in `main`) and lent by reference to the migrator, the event store,
//! the aggregation engine and the audit service.

use crate::error::{StoreError, StoreResult};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=5000;
    PRAGMA foreign_keys=ON;
    PRAGMA temp_store=MEMORY;
";

pub struct Database {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database file, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }

        let conn = Self::connect(path)?;
        info!(path = %path.display(), "Opened usage database");

        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    fn connect(path: &Path) -> StoreResult<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;
        Ok(conn)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the current connection and open a fresh one on the same file.
    ///
    /// Cached prepared statements belong to the old connection and are
    /// flushed before it is dropped. In-memory databases cannot be reopened
    /// without losing their contents, so for them only the cache is flushed.
    pub fn reopen(&self) -> StoreResult<()> {
        let mut guard = self.lock()?;
        guard.flush_prepared_statement_cache();

        if let Some(path) = &self.path {
            let fresh = Self::connect(path)?;
            let old = std::mem::replace(&mut *guard, fresh);
            if let Err((_, err)) = old.close() {
                debug!(error = %err, "Old connection did not close cleanly");
            }
            debug!(path = %path.display(), "Reopened usage database");
        }
        Ok(())
    }

    /// Run `f` with shared access to the connection.
    pub fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let guard = self.lock()?;
        f(&guard)
    }

    /// Run `f` with exclusive access, needed for explicit transactions.
    pub fn with_conn_mut<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self.lock()?;
        f(&mut guard)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("stats.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), Some(path.as_path()));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("stats.db")).unwrap();
        db.with_conn(|c| {
            c.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")?;
            Ok(())
        })
        .unwrap();

        db.reopen().unwrap();

        let x: i64 = db
            .with_conn(|c| Ok(c.query_row("SELECT x FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(x, 7);
    }
}
