use std::env;
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

#[cfg(test)]
mod config_tests {
    use super::*;
    use usage_ledger::config::Config;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        // Logging defaults
        assert_eq!(config.logging.level, "WARN");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.output, "console");

        // Audit defaults
        assert_eq!(config.audit.tool, "ccusage");
        assert!(config.audit.tool_args.is_empty());
        assert_eq!(config.audit.local_timeout_secs, 30);
        assert_eq!(config.audit.remote_timeout_secs, 60);
        assert_eq!(config.audit.excerpt_chars, 200);

        assert_eq!(config.aggregation.slow_query_ms, 100);
        assert!(config.database.path.ends_with("usage.db"));
        assert!(config.remotes.is_empty());
    }

    // Every variable is set and cleared inside one test so parallel tests
    // never observe each other's overrides.
    #[test]
    fn test_env_variable_override() {
        env::set_var("USAGE_LEDGER_DB", "/tmp/ledger-test.db");
        env::set_var("USAGE_LEDGER_AUDIT_TOOL", "bunx");
        env::set_var("USAGE_LEDGER_LOCAL_TIMEOUT_SECS", "12");
        env::set_var("USAGE_LEDGER_REMOTE_TIMEOUT_SECS", "90");
        env::set_var("USAGE_LEDGER_SLOW_QUERY_MS", "250");
        env::set_var("LOG_LEVEL", "DEBUG");

        let mut config = Config::default();
        config
            .apply_env_overrides()
            .expect("Failed to apply env overrides");

        assert_eq!(config.database.path, PathBuf::from("/tmp/ledger-test.db"));
        assert_eq!(config.audit.tool, "bunx");
        assert_eq!(config.audit.local_timeout_secs, 12);
        assert_eq!(config.audit.remote_timeout_secs, 90);
        assert_eq!(config.aggregation.slow_query_ms, 250);
        assert_eq!(config.logging.level, "DEBUG");

        env::set_var("USAGE_LEDGER_LOCAL_TIMEOUT_SECS", "soon");
        let mut config = Config::default();
        assert!(config.apply_env_overrides().is_err());

        for key in [
            "USAGE_LEDGER_DB",
            "USAGE_LEDGER_AUDIT_TOOL",
            "USAGE_LEDGER_LOCAL_TIMEOUT_SECS",
            "USAGE_LEDGER_REMOTE_TIMEOUT_SECS",
            "USAGE_LEDGER_SLOW_QUERY_MS",
            "LOG_LEVEL",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_load_from_file_with_remotes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage-ledger.toml");
        fs::write(
            &path,
            r#"
[logging]
level = "INFO"
format = "json"

[database]
path = "/var/lib/usage-ledger/usage.db"

[audit]
tool = "npx"
tool_args = ["ccusage@latest"]
local_timeout_secs = 20

[[remotes]]
name = "workstation"
host = "10.0.0.5"
user = "dev"

[[remotes]]
name = "laptop"
host = "laptop.lan"
port = 2222
enabled = false
"#,
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.logging.level, "INFO");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.output, "console");
        assert_eq!(config.database.path, PathBuf::from("/var/lib/usage-ledger/usage.db"));
        assert_eq!(config.audit.tool_args, vec!["ccusage@latest"]);
        assert_eq!(config.audit.local_timeout_secs, 20);
        assert_eq!(config.audit.remote_timeout_secs, 60);
        assert_eq!(config.remotes.len(), 2);
        assert_eq!(config.remotes[0].destination(), "dev@10.0.0.5");
        assert!(!config.remotes[1].enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[audit\ntool = ").unwrap();
        assert!(Config::load_from_file(&path).is_err());
        assert!(Config::load_from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.audit.tool = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.audit.excerpt_chars = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.output = "syslog".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = Config::default();
        config.audit.tool = "bunx".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.audit.tool, "bunx");
        assert_eq!(loaded.database.path, config.database.path);
    }
}
