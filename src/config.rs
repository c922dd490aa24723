//! Configuration system
//!
//! Provides centralized configuration management with:
//! - Config file loading (optional)
//! - Environment variable overrides
//! - Runtime defaults
//! - Validation

use crate::audit::RemoteHost;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,

    pub database: DatabaseConfig,

    pub aggregation: AggregationConfig,

    pub audit: AuditConfig,

    /// Hosts asked for authoritative usage when this machine has none
    pub remotes: Vec<RemoteHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "WARN".to_string(),
            format: "pretty".to_string(),
            output: "console".to_string(),
            directory: data_dir().join("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("usage.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Aggregations slower than this are logged at warn level
    pub slow_query_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { slow_query_ms: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// External usage CLI, resolved through PATH
    pub tool: String,
    /// Arguments placed before the report arguments (e.g. `["ccusage@latest"]` for `npx`)
    pub tool_args: Vec<String>,
    pub local_timeout_secs: u64,
    pub remote_timeout_secs: u64,
    pub ssh_connect_timeout_secs: u64,
    /// Length of the stdout excerpt carried by malformed-output errors
    pub excerpt_chars: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            tool: "ccusage".to_string(),
            tool_args: Vec::new(),
            local_timeout_secs: 30,
            remote_timeout_secs: 60,
            ssh_connect_timeout_secs: 10,
            excerpt_chars: 200,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("usage-ledger")
}

impl Config {
    /// Load configuration from file, environment, and defaults
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        let config_paths = [
            PathBuf::from("usage-ledger.toml"),
            PathBuf::from(".usage-ledger.toml"),
            dirs::config_dir()
                .map(|d| d.join("usage-ledger").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &config_paths {
            if path.is_file() {
                info!(config_file = %path.display(), "Loading configuration from file");
                config = Self::load_from_file(path)?;
                break;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }
        if let Ok(val) = env::var("USAGE_LEDGER_LOG_DIR") {
            self.logging.directory = PathBuf::from(val);
        }

        if let Ok(val) = env::var("USAGE_LEDGER_DB") {
            self.database.path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("USAGE_LEDGER_SLOW_QUERY_MS") {
            self.aggregation.slow_query_ms =
                val.parse().context("Invalid USAGE_LEDGER_SLOW_QUERY_MS")?;
        }

        if let Ok(val) = env::var("USAGE_LEDGER_AUDIT_TOOL") {
            self.audit.tool = val;
        }
        if let Ok(val) = env::var("USAGE_LEDGER_LOCAL_TIMEOUT_SECS") {
            self.audit.local_timeout_secs = val
                .parse()
                .context("Invalid USAGE_LEDGER_LOCAL_TIMEOUT_SECS")?;
        }
        if let Ok(val) = env::var("USAGE_LEDGER_REMOTE_TIMEOUT_SECS") {
            self.audit.remote_timeout_secs = val
                .parse()
                .context("Invalid USAGE_LEDGER_REMOTE_TIMEOUT_SECS")?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.audit.tool.trim().is_empty() {
            return Err(anyhow::anyhow!("audit.tool must not be empty"));
        }

        if self.audit.local_timeout_secs == 0 || self.audit.remote_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Audit timeouts must be greater than 0"));
        }

        if self.audit.remote_timeout_secs < self.audit.local_timeout_secs {
            warn!(
                local_timeout_secs = self.audit.local_timeout_secs,
                remote_timeout_secs = self.audit.remote_timeout_secs,
                "Remote audit timeout is shorter than the local one"
            );
        }

        if self.audit.excerpt_chars == 0 {
            return Err(anyhow::anyhow!("audit.excerpt_chars must be greater than 0"));
        }

        let mut seen = std::collections::HashSet::new();
        for remote in &self.remotes {
            if remote.name.trim().is_empty() || remote.host.trim().is_empty() {
                return Err(anyhow::anyhow!("Every [[remotes]] entry needs a name and a host"));
            }
            if !seen.insert(remote.name.as_str()) {
                return Err(anyhow::anyhow!("Duplicate remote name: {}", remote.name));
            }
        }

        match self.logging.output.as_str() {
            "console" | "file" | "both" => {}
            other => {
                return Err(anyhow::anyhow!(
                    "logging.output must be console, file or both, got {other}"
                ))
            }
        }

        Ok(())
    }

    /// Save current configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!(path = %path.display(), "Configuration saved to file");

        Ok(())
    }
}
