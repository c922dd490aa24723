mod common;

use rusqlite::Transaction;
use tempfile::TempDir;
use usage_ledger::migrations::{Migration, MigrationStatus};
use usage_ledger::{Database, MigrationError, SchemaMigrator};

fn table_exists(db: &Database, name: &str) -> bool {
    db.with_conn(|c| {
        let n: i64 = c.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    })
    .unwrap()
}

fn create_a(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch("CREATE TABLE a (id INTEGER PRIMARY KEY);")
}

fn create_b_then_fail(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch("CREATE TABLE b (id INTEGER PRIMARY KEY);")?;
    tx.execute_batch("ALTER TABLE does_not_exist ADD COLUMN x INTEGER;")
}

fn create_b(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch("CREATE TABLE b (id INTEGER PRIMARY KEY);")
}

#[test]
fn test_fresh_database_reaches_latest_version() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("usage.db")).unwrap();
    let migrator = SchemaMigrator::new();

    assert_eq!(migrator.current_version(&db).unwrap(), 0);
    assert!(migrator.has_pending(&db).unwrap());

    let report = migrator.run_migrations(&db).unwrap();
    assert_eq!(report.from_version, 0);
    assert_eq!(report.to_version, 4);
    assert_eq!(report.applied, vec![1, 2, 3, 4]);

    assert_eq!(migrator.current_version(&db).unwrap(), 4);
    assert!(table_exists(&db, "query_events"));
    assert!(table_exists(&db, "audit_snapshots"));

    let history = migrator.history(&db).unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|r| r.status == MigrationStatus::Success));
    assert_eq!(
        history.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
}

#[test]
fn test_history_lookup_does_not_write() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("usage.db")).unwrap();
    let migrator = SchemaMigrator::new();

    assert!(migrator.history(&db).unwrap().is_empty());
    assert!(!table_exists(&db, "_migrations"));
    assert_eq!(migrator.current_version(&db).unwrap(), 0);
}

#[test]
fn test_second_run_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let db = common::migrated_db(&dir).unwrap();
    let migrator = SchemaMigrator::new();

    let report = migrator.run_migrations(&db).unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(report.from_version, 4);
    assert_eq!(migrator.history(&db).unwrap().len(), 4);
}

#[test]
fn test_version_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("usage.db");
    {
        let db = Database::open(&path).unwrap();
        SchemaMigrator::new().run_migrations(&db).unwrap();
    }
    let db = Database::open(&path).unwrap();
    let migrator = SchemaMigrator::new();
    assert_eq!(migrator.current_version(&db).unwrap(), 4);
    assert!(!migrator.has_pending(&db).unwrap());
}

#[test]
fn test_failed_migration_rolls_back_and_is_recorded() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("usage.db")).unwrap();

    let broken = SchemaMigrator::with_migrations(vec![
        Migration {
            version: 1,
            description: "create a",
            up: create_a,
        },
        Migration {
            version: 2,
            description: "create b, then fail",
            up: create_b_then_fail,
        },
    ])
    .unwrap();

    let err = broken.run_migrations(&db).unwrap_err();
    match err {
        MigrationError::Failed { version, .. } => assert_eq!(version, 2),
        other => panic!("unexpected error: {other:?}"),
    }

    // Version 1 committed, version 2 left nothing behind.
    assert_eq!(broken.current_version(&db).unwrap(), 1);
    assert!(table_exists(&db, "a"));
    assert!(!table_exists(&db, "b"));

    let history = broken.history(&db).unwrap();
    let failed = history.iter().find(|r| r.version == 2).unwrap();
    assert_eq!(failed.status, MigrationStatus::Failed);
    assert!(failed.error_message.as_deref().unwrap_or("").contains("does_not_exist"));

    // A corrected migration applies cleanly afterwards.
    let fixed = SchemaMigrator::with_migrations(vec![
        Migration {
            version: 1,
            description: "create a",
            up: create_a,
        },
        Migration {
            version: 2,
            description: "create b",
            up: create_b,
        },
    ])
    .unwrap();
    let report = fixed.run_migrations(&db).unwrap();
    assert_eq!(report.applied, vec![2]);
    assert!(table_exists(&db, "b"));
    let history = fixed.history(&db).unwrap();
    let second = history.iter().find(|r| r.version == 2).unwrap();
    assert_eq!(second.status, MigrationStatus::Success);
    assert!(second.error_message.is_none());
}

#[test]
fn test_registry_must_be_strictly_ascending() {
    let result = SchemaMigrator::with_migrations(vec![
        Migration {
            version: 2,
            description: "two",
            up: create_b,
        },
        Migration {
            version: 1,
            description: "one",
            up: create_a,
        },
    ]);
    assert!(matches!(result, Err(MigrationError::InvalidRegistry(_))));

    let zero = SchemaMigrator::with_migrations(vec![Migration {
        version: 0,
        description: "zero",
        up: create_a,
    }]);
    assert!(zero.is_err());
}
