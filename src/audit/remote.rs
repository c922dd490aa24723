//! Remote hosts that may hold usage history when this machine has none.

use crate::error::ExternalError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// One `[[remotes]]` entry from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteHost {
    /// Short name used on the command line (`audit --host <name>`).
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RemoteHost {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            enabled: true,
        }
    }

    /// `user@host`, or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Runs one shell command on a remote host.
///
/// Transport failures (unreachable host, auth refused) come back as
/// [`ExternalError::Transport`]; the remote command's own exit status is
/// left for the caller to interpret.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(
        &self,
        host: &RemoteHost,
        command: &str,
        budget: Duration,
    ) -> Result<RemoteOutput, ExternalError>;
}

/// `ssh` in batch mode; never prompts for a password.
#[derive(Debug, Clone)]
pub struct SshShell {
    connect_timeout: Duration,
}

impl SshShell {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for SshShell {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(
        &self,
        host: &RemoteHost,
        command: &str,
        budget: Duration,
    ) -> Result<RemoteOutput, ExternalError> {
        let connect_secs = self.connect_timeout.as_secs().clamp(1, budget.as_secs().max(1));

        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={connect_secs}"))
            .arg("-o")
            .arg("LogLevel=ERROR");
        if let Some(port) = host.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &host.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg("--")
            .arg(host.destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %host.name, command = %command, "Running remote usage command");

        let output = match timeout(budget, cmd.output()).await {
            Err(_) => return Err(ExternalError::Timeout { after: budget }),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExternalError::Transport {
                    host: host.name.clone(),
                    message: "ssh client not found".to_string(),
                })
            }
            Ok(Err(e)) => return Err(ExternalError::Io(e)),
            Ok(Ok(output)) => output,
        };

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // ssh reserves 255 for its own failures.
        if output.status.code() == Some(255) {
            return Err(ExternalError::Transport {
                host: host.name.clone(),
                message: describe_ssh_failure(&stderr),
            });
        }

        Ok(RemoteOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code: output.status.code(),
        })
    }
}

fn describe_ssh_failure(stderr: &str) -> String {
    if stderr.contains("Connection refused") {
        "Connection refused".to_string()
    } else if stderr.contains("Connection timed out") || stderr.contains("timed out") {
        "Connection timed out".to_string()
    } else if stderr.contains("Permission denied") {
        "Permission denied (key not loaded in ssh-agent?)".to_string()
    } else if stderr.contains("Could not resolve hostname") {
        "Could not resolve hostname".to_string()
    } else {
        let trimmed = stderr.trim();
        if trimmed.is_empty() {
            "ssh exited with status 255".to_string()
        } else {
            trimmed.lines().next().unwrap_or(trimmed).to_string()
        }
    }
}

/// Single-quote `arg` for a POSIX shell unless it is plainly safe.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | '@'));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
