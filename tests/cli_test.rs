use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ledger(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("usage-ledger").unwrap();
    cmd.arg("--db")
        .arg(dir.path().join("usage.db"))
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("config"))
        .env("XDG_DATA_HOME", dir.path().join("data"))
        .env("USAGE_LEDGER_LOG_DIR", dir.path().join("logs"))
        .env("LOG_LEVEL", "ERROR")
        .env_remove("USAGE_LEDGER_DB")
        .env_remove("USAGE_LEDGER_AUDIT_TOOL");
    cmd
}

#[test]
fn test_migrate_reports_latest_version() {
    let dir = TempDir::new().unwrap();
    ledger(&dir)
        .args(["migrate", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"currentVersion\": 4"))
        .stdout(predicate::str::contains("\"targetVersion\": 4"));

    ledger(&dir)
        .args(["migrate", "--status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"currentVersion\": 4"));
}

#[test]
fn test_stats_and_events_on_empty_database() {
    let dir = TempDir::new().unwrap();
    ledger(&dir)
        .args(["stats", "--range", "month", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"totalQueries\": 0"));

    ledger(&dir)
        .args(["events", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn test_history_is_empty_before_any_audit() {
    let dir = TempDir::new().unwrap();
    ledger(&dir)
        .args(["history", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));

    ledger(&dir)
        .args(["history", "--from", "2026-01-01", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn test_audit_with_missing_tool_fails() {
    let dir = TempDir::new().unwrap();
    ledger(&dir)
        .env("USAGE_LEDGER_AUDIT_TOOL", "usage-ledger-no-such-tool")
        .args(["audit", "--json"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("\"error\""))
        .stdout(predicate::str::contains("usage-ledger-no-such-tool"));

    ledger(&dir)
        .args(["history", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn test_invalid_arguments_are_rejected() {
    let dir = TempDir::new().unwrap();
    ledger(&dir)
        .args(["stats", "--range", "fortnight"])
        .assert()
        .failure();

    ledger(&dir)
        .args(["audit", "--type", "hourly"])
        .assert()
        .failure();

    ledger(&dir)
        .args(["audit", "--since", "2026-02-10", "--until", "2026-02-01", "--json"])
        .env("USAGE_LEDGER_AUDIT_TOOL", "usage-ledger-no-such-tool")
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"error\""));
}
