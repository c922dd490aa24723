//! Output Formatting and Display Management
//!
//! Every command prints either human-readable colored output or structured
//! JSON on stdout. Logs never go to stdout, so JSON output can be piped.
//!
//! ## Report Types
//! - **Stats**: dashboard aggregation (per agent, source, location, day, hour,
//!   sessions, tokens)
//! - **Events**: raw usage facts, most recent first
//! - **Audit**: one reconciliation result with entries, breakdowns and anomalies
//! - **History**: past audit snapshots, newest first
//! - **Migrations**: schema version and migration history

use crate::audit::{AnomalySeverity, AuditResult, AuditSnapshot, AuditStatus};
use crate::migrations::{MigrationRecord, MigrationStatus};
use crate::models::{StatsAggregation, UsageRecord};
use chrono::{DateTime, Local, Utc};
use colored::{ColoredString, Colorize};
use serde::Serialize;

pub struct DisplayManager;

impl Default for DisplayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayManager {
    pub fn new() -> Self {
        Self
    }

    pub fn print_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json_str) => println!("{}", json_str),
            Err(e) => eprintln!("Error serializing output to JSON: {}", e),
        }
    }

    fn header(&self, title: &str) {
        println!("\n{}", "=".repeat(80).bright_cyan());
        println!("{}", title.bright_white().bold());
        println!("{}", "=".repeat(80).bright_cyan());
    }

    pub fn display_stats(&self, stats: &StatsAggregation, json_output: bool) {
        if json_output {
            self.print_json(stats);
            return;
        }

        self.header("Usage Statistics");

        println!(
            "\n{} {} queries • {} total • {} avg • {} sessions\n",
            "📊".bright_yellow(),
            stats.total_queries.to_string().bright_white().bold(),
            format_duration(stats.total_duration).bright_white().bold(),
            format_duration(stats.avg_duration.round() as u64).bright_white(),
            stats.sessions.total_sessions.to_string().bright_white().bold()
        );

        println!(
            "   Sources: {} user / {} auto    Location: {} local / {} remote",
            stats.by_source.user.to_string().bright_cyan(),
            stats.by_source.auto.to_string().bright_cyan(),
            stats.by_location.local.to_string().bright_cyan(),
            stats.by_location.remote.to_string().bright_cyan()
        );

        if !stats.by_agent.is_empty() {
            println!("\n{} By agent:", "🤖".bright_blue());
            for (agent, agent_stats) in &stats.by_agent {
                println!(
                    "   {}: {} queries, {} ({} tok/s)",
                    agent.bright_cyan(),
                    agent_stats.count.to_string().bright_white(),
                    format_duration(agent_stats.duration),
                    format!("{:.1}", agent_stats.avg_tokens_per_second).bright_yellow()
                );
            }
        }

        if !stats.by_day.is_empty() {
            println!("\n{} By day:", "📅".bright_blue());
            for day in &stats.by_day {
                println!(
                    "   {}: {} queries, {}",
                    day.date.bright_white().bold(),
                    day.count.to_string().bright_white(),
                    format_duration(day.duration)
                );
            }
        }

        let tokens = &stats.tokens;
        println!("\n{} Tokens:", "🔢".bright_blue());
        println!(
            "   input {} • output {} • cache read {} • cache write {}",
            tokens.total_input_tokens.to_string().bright_white(),
            tokens.total_output_tokens.to_string().bright_white(),
            tokens.total_cache_read_tokens.to_string().bright_white(),
            tokens.total_cache_write_tokens.to_string().bright_white()
        );
        println!(
            "   {} queries with token data, {} output tokens/query, {} tok/s",
            tokens.queries_with_token_data.to_string().bright_white(),
            format!("{:.1}", tokens.avg_output_tokens_per_query).bright_yellow(),
            format!("{:.1}", tokens.avg_tokens_per_second).bright_yellow()
        );
        println!(
            "\n{}",
            format!("Computed in {} ms", stats.query_time_ms).dimmed()
        );
    }

    pub fn display_events(&self, events: &[UsageRecord], json_output: bool) {
        if json_output {
            self.print_json(&events);
            return;
        }

        self.header("Usage Events");
        if events.is_empty() {
            println!("\n   No events in range.");
            return;
        }

        println!();
        for record in events {
            let fact = &record.fact;
            let tokens = match (fact.input_tokens, fact.output_tokens) {
                (None, None) => "-".to_string(),
                (input, output) => format!(
                    "{} in / {} out",
                    input.unwrap_or(0),
                    output.unwrap_or(0)
                ),
            };
            println!(
                "   {} {} {} {} {} {}",
                format_timestamp(fact.start_time).bright_white(),
                fact.agent_type.bright_cyan(),
                fact.source.as_str(),
                format_duration(fact.duration_ms).bright_white(),
                tokens,
                fact.session_id.dimmed()
            );
        }
    }

    pub fn display_audit(&self, result: &AuditResult, snapshot_id: Option<i64>, json_output: bool) {
        if json_output {
            match snapshot_id {
                Some(id) => self.print_json(&serde_json::json!({
                    "snapshotId": id,
                    "result": result,
                })),
                None => self.print_json(result),
            }
            return;
        }

        self.header(&format!(
            "Usage Audit ({}) {} → {}",
            result.audit_type, result.period.start, result.period.end
        ));

        let totals = &result.totals;
        println!(
            "\n{} Local {} tokens / {}   Authoritative {} tokens / {}",
            "📊".bright_yellow(),
            totals.local.total_tokens.to_string().bright_white().bold(),
            format!("${:.2}", totals.local.cost).bright_green().bold(),
            totals.external.total_tokens.to_string().bright_white().bold(),
            format!("${:.2}", totals.external.cost).bright_green().bold()
        );
        println!(
            "   Discrepancy: tokens {}  cost {}",
            format!("{:.2}%", totals.token_discrepancy_pct).bright_yellow(),
            format!("{:.2}%", totals.cost_discrepancy_pct).bright_yellow()
        );

        let s = &result.summary;
        println!(
            "   Entries: {} • {} match • {} minor • {} major • {} missing",
            s.total.to_string().bright_white().bold(),
            s.matched.to_string().green(),
            s.minor.to_string().yellow(),
            s.major.to_string().red(),
            s.missing.to_string().magenta()
        );

        if !result.entries.is_empty() {
            println!("\n{} Entries:", "📅".bright_blue());
            for entry in &result.entries {
                println!(
                    "   {} {} {} {} local {} / {} vs {} / {} ({:.2}%)",
                    entry.date.to_string().bright_white().bold(),
                    status_label(entry.status),
                    entry.model.bright_cyan(),
                    entry.billing_mode,
                    entry.local_total_tokens,
                    format!("${:.2}", entry.local_cost).bright_green(),
                    entry.external_total_tokens,
                    format!("${:.2}", entry.external_cost).bright_green(),
                    entry.discrepancy_pct
                );
            }
        }

        if !result.model_breakdown.is_empty() {
            println!("\n{} By model:", "🤖".bright_blue());
            for model in &result.model_breakdown {
                println!(
                    "   {}: local {} / {}  authoritative {} / {}",
                    model.model.bright_cyan(),
                    model.local_tokens,
                    format!("${:.2}", model.local_cost).bright_green(),
                    model.external_tokens,
                    format!("${:.2}", model.external_cost).bright_green()
                );
            }
        }

        let billing = &result.billing_mode_breakdown;
        println!(
            "\n{} Billing: api {} entries ({})  max {} entries (API value {})",
            "💳".bright_blue(),
            billing.api.entry_count,
            format!("${:.2}", billing.api.local_cost).bright_green(),
            billing.max.entry_count,
            format!("${:.2}", billing.max.cache_savings).bright_green()
        );

        for anomaly in &result.anomalies {
            let badge = match anomaly.severity {
                AnomalySeverity::Warning => "WARNING".yellow().bold(),
                AnomalySeverity::Error => "ERROR".red().bold(),
            };
            println!("\n   {} {}", badge, anomaly.message);
        }

        if let Some(id) = snapshot_id {
            println!("\n{}", format!("Saved as snapshot #{id}").dimmed());
        }
    }

    pub fn display_history(&self, snapshots: &[AuditSnapshot], json_output: bool) {
        if json_output {
            self.print_json(&snapshots);
            return;
        }

        self.header("Audit History");
        if snapshots.is_empty() {
            println!("\n   No audits recorded yet.");
            return;
        }

        println!();
        for snap in snapshots {
            let r = &snap.result;
            println!(
                "   #{} {} {} {} → {}  tokens {}  cost {}  {} entries ({} major, {} missing)",
                snap.id.to_string().bright_white().bold(),
                format_timestamp(snap.created_at).dimmed(),
                snap.audit_type.to_string().bright_cyan(),
                snap.period.start,
                snap.period.end,
                format!("{:.2}%", r.totals.token_discrepancy_pct).bright_yellow(),
                format!("{:.2}%", r.totals.cost_discrepancy_pct).bright_yellow(),
                r.summary.total,
                r.summary.major,
                r.summary.missing
            );
        }
    }

    pub fn display_migrations(
        &self,
        current: u32,
        target: u32,
        history: &[MigrationRecord],
        json_output: bool,
    ) {
        if json_output {
            self.print_json(&serde_json::json!({
                "currentVersion": current,
                "targetVersion": target,
                "history": history,
            }));
            return;
        }

        self.header("Schema Migrations");
        let state = if current >= target {
            "up to date".green()
        } else {
            format!("{} pending", target - current).yellow()
        };
        println!(
            "\n   Version {} of {} ({})\n",
            current.to_string().bright_white().bold(),
            target,
            state
        );
        for record in history {
            let status = match record.status {
                MigrationStatus::Success => "ok".green(),
                MigrationStatus::Failed => "failed".red().bold(),
            };
            println!(
                "   v{} {} {} {}",
                record.version,
                status,
                format_timestamp(record.applied_at).dimmed(),
                record.description
            );
            if let Some(err) = &record.error_message {
                println!("      {}", err.red());
            }
        }
    }
}

fn status_label(status: AuditStatus) -> ColoredString {
    match status {
        AuditStatus::Match => "match".green(),
        AuditStatus::Minor => "minor".yellow(),
        AuditStatus::Major => "major".red().bold(),
        AuditStatus::Missing => "missing".magenta(),
    }
}

fn format_timestamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        let minutes = ms / 60_000;
        let seconds = (ms % 60_000) / 1_000;
        format!("{minutes}m{seconds:02}s")
    }
}
