//! Acquisition of authoritative usage from the external reporting CLI,
//! either on this machine or over a [`RemoteShell`].

use super::normalize::{excerpt, looks_like_json, mentions_missing_history, parse_report};
use super::remote::{shell_quote, RemoteHost, RemoteShell, SshShell};
use super::types::{ExternalReport, ReportPeriod};
use crate::config::AuditConfig;
use crate::error::ExternalError;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Source of authoritative reports. The audit service only talks to this.
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    async fn fetch_local(
        &self,
        period: ReportPeriod,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<ExternalReport, ExternalError>;

    async fn fetch_remote(
        &self,
        host: &RemoteHost,
        period: ReportPeriod,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<ExternalReport, ExternalError>;
}

pub struct ExternalUsageClient {
    tool: String,
    tool_args: Vec<String>,
    local_timeout: Duration,
    remote_timeout: Duration,
    excerpt_chars: usize,
    shell: Arc<dyn RemoteShell>,
}

impl ExternalUsageClient {
    pub fn new(tool: impl Into<String>) -> Self {
        let defaults = AuditConfig::default();
        Self {
            tool: tool.into(),
            tool_args: Vec::new(),
            local_timeout: Duration::from_secs(defaults.local_timeout_secs),
            remote_timeout: Duration::from_secs(defaults.remote_timeout_secs),
            excerpt_chars: defaults.excerpt_chars,
            shell: Arc::new(SshShell::new(Duration::from_secs(
                defaults.ssh_connect_timeout_secs,
            ))),
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            tool: config.tool.clone(),
            tool_args: config.tool_args.clone(),
            local_timeout: Duration::from_secs(config.local_timeout_secs),
            remote_timeout: Duration::from_secs(config.remote_timeout_secs),
            excerpt_chars: config.excerpt_chars,
            shell: Arc::new(SshShell::new(Duration::from_secs(
                config.ssh_connect_timeout_secs,
            ))),
        }
    }

    pub fn with_tool_args(mut self, args: Vec<String>) -> Self {
        self.tool_args = args;
        self
    }

    pub fn with_timeouts(mut self, local: Duration, remote: Duration) -> Self {
        self.local_timeout = local;
        self.remote_timeout = remote;
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn RemoteShell>) -> Self {
        self.shell = shell;
        self
    }

    /// `<period> --json [--since YYYYMMDD] [--until YYYYMMDD]`
    pub fn report_args(
        period: ReportPeriod,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Vec<String> {
        let mut args = vec![period.as_str().to_string(), "--json".to_string()];
        if let Some(since) = since {
            args.push("--since".to_string());
            args.push(since.format("%Y%m%d").to_string());
        }
        if let Some(until) = until {
            args.push("--until".to_string());
            args.push(until.format("%Y%m%d").to_string());
        }
        args
    }

    /// Run the tool locally under the local time budget.
    pub async fn fetch_authoritative(
        &self,
        period: ReportPeriod,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<ExternalReport, ExternalError> {
        let args = Self::report_args(period, since, until);
        let started = Instant::now();

        let mut cmd = Command::new(&self.tool);
        cmd.args(&self.tool_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(tool = %self.tool, args = ?args, "Running usage tool");

        let output = match timeout(self.local_timeout, cmd.output()).await {
            Err(_) => {
                warn!(tool = %self.tool, budget_secs = self.local_timeout.as_secs(), "Usage tool timed out");
                return Err(ExternalError::Timeout {
                    after: self.local_timeout,
                });
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExternalError::ToolNotFound {
                    tool: self.tool.clone(),
                })
            }
            Ok(Err(e)) => return Err(ExternalError::Io(e)),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let report = self.interpret(&stdout, &stderr, output.status.code(), period)?;

        info!(
            tool = %self.tool,
            days = report.days.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched authoritative usage"
        );
        Ok(report)
    }

    /// Run the tool on `host` through the configured shell under the remote
    /// time budget.
    pub async fn fetch_authoritative_remote(
        &self,
        host: &RemoteHost,
        period: ReportPeriod,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<ExternalReport, ExternalError> {
        let command = std::iter::once(self.tool.as_str())
            .chain(self.tool_args.iter().map(String::as_str))
            .map(shell_quote)
            .chain(Self::report_args(period, since, until).iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ");

        let output = self.shell.run(host, &command, self.remote_timeout).await?;
        let report = self.interpret(&output.stdout, &output.stderr, output.exit_code, period)?;

        info!(host = %host.name, days = report.days.len(), "Fetched authoritative usage from remote");
        Ok(report)
    }

    /// Classify a finished tool run into a report or a typed failure.
    pub fn interpret(
        &self,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i32>,
        period: ReportPeriod,
    ) -> Result<ExternalReport, ExternalError> {
        if exit_code == Some(127) {
            return Err(ExternalError::ToolNotFound {
                tool: self.tool.clone(),
            });
        }

        let success = exit_code == Some(0);
        let json = looks_like_json(stdout);
        // A clean run with a JSON report wins over warnings on stderr.
        if (!success || !json)
            && (mentions_missing_history(stderr) || (!json && mentions_missing_history(stdout)))
        {
            return Err(ExternalError::NoUsageHistory);
        }

        if !success && !json {
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(ExternalError::CommandFailed {
                status: exit_code.unwrap_or(-1),
                stderr: excerpt(detail, self.excerpt_chars),
            });
        }

        parse_report(stdout, period, self.excerpt_chars)
    }
}

#[async_trait]
impl UsageFetcher for ExternalUsageClient {
    async fn fetch_local(
        &self,
        period: ReportPeriod,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<ExternalReport, ExternalError> {
        self.fetch_authoritative(period, since, until).await
    }

    async fn fetch_remote(
        &self,
        host: &RemoteHost,
        period: ReportPeriod,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<ExternalReport, ExternalError> {
        self.fetch_authoritative_remote(host, period, since, until)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ExternalUsageClient {
        ExternalUsageClient::new("ccusage")
    }

    #[test]
    fn test_report_args() {
        let since = NaiveDate::from_ymd_opt(2026, 2, 1);
        let until = NaiveDate::from_ymd_opt(2026, 2, 7);
        assert_eq!(
            ExternalUsageClient::report_args(ReportPeriod::Daily, since, until),
            vec!["daily", "--json", "--since", "20260201", "--until", "20260207"]
        );
        assert_eq!(
            ExternalUsageClient::report_args(ReportPeriod::Monthly, None, None),
            vec!["monthly", "--json"]
        );
    }

    #[test]
    fn test_interpret_exit_127_is_tool_not_found() {
        let err = client()
            .interpret("", "sh: ccusage: command not found", Some(127), ReportPeriod::Daily)
            .unwrap_err();
        assert!(matches!(err, ExternalError::ToolNotFound { .. }));
    }

    #[test]
    fn test_interpret_missing_history() {
        let err = client()
            .interpret(
                "",
                "Error: No valid Claude data directories found",
                Some(1),
                ReportPeriod::Daily,
            )
            .unwrap_err();
        assert!(matches!(err, ExternalError::NoUsageHistory));
    }

    #[test]
    fn test_interpret_banner_text_is_malformed() {
        let err = client()
            .interpret("WARN: new version available\n{}", "", Some(0), ReportPeriod::Daily)
            .unwrap_err();
        match err {
            ExternalError::MalformedOutput { excerpt } => {
                assert!(excerpt.starts_with("WARN: new version"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_interpret_failure_status() {
        let err = client()
            .interpret("", "boom", Some(2), ReportPeriod::Daily)
            .unwrap_err();
        match err {
            ExternalError::CommandFailed { status, stderr } => {
                assert_eq!(status, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_interpret_valid_json() {
        let report = client()
            .interpret(
                r#"{"daily":[{"date":"2026-02-01","inputTokens":5,"totalCost":0.1}]}"#,
                "",
                Some(0),
                ReportPeriod::Daily,
            )
            .unwrap();
        assert_eq!(report.days.len(), 1);
        assert_eq!(report.days[0].total_tokens, 5);
    }

    #[test]
    fn test_interpret_stderr_warning_keeps_good_report() {
        let report = client()
            .interpret(
                r#"{"daily":[{"date":"2026-02-01","inputTokens":5,"totalCost":0.1}]}"#,
                "warning: no usage data found in /extra/dir, skipping",
                Some(0),
                ReportPeriod::Daily,
            )
            .unwrap();
        assert_eq!(report.days.len(), 1);
        assert_eq!(report.days[0].total_tokens, 5);

        // The same warning with a failed run still means no history.
        let err = client()
            .interpret(
                "",
                "warning: no usage data found in /extra/dir, skipping",
                Some(1),
                ReportPeriod::Daily,
            )
            .unwrap_err();
        assert!(matches!(err, ExternalError::NoUsageHistory));
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_not_found() {
        let client = ExternalUsageClient::new("usage-ledger-definitely-missing-tool");
        let err = client
            .fetch_authoritative(ReportPeriod::Daily, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalError::ToolNotFound { .. }));
    }
}
