//! Audit data model.
//!
//! [`AuditResult`] is the wire contract consumed by the dashboard and the
//! durable payload stored in every snapshot; it must round-trip through JSON
//! without loss.

use crate::models::BillingMode;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditType {
    Daily,
    Weekly,
    Monthly,
    Manual,
}

impl AuditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditType::Daily => "daily",
            AuditType::Weekly => "weekly",
            AuditType::Monthly => "monthly",
            AuditType::Manual => "manual",
        }
    }
}

impl FromStr for AuditType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(AuditType::Daily),
            "weekly" => Ok(AuditType::Weekly),
            "monthly" => Ok(AuditType::Monthly),
            "manual" => Ok(AuditType::Manual),
            other => Err(format!("unknown audit type: {other}")),
        }
    }
}

impl fmt::Display for AuditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report granularity passed to the external usage tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl ReportPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportPeriod::Daily => "daily",
            ReportPeriod::Weekly => "weekly",
            ReportPeriod::Monthly => "monthly",
        }
    }
}

/// Inclusive calendar-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl AuditPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenCounts {
    pub fn new(input: u64, output: u64, cache_read: u64, cache_write: u64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_write,
        }
    }

    /// Sum of all four categories, saturating at `u64::MAX`.
    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_write)
    }

    /// `None` when the four categories do not fit in a `u64`.
    pub fn checked_total(&self) -> Option<u64> {
        self.input
            .checked_add(self.output)?
            .checked_add(self.cache_read)?
            .checked_add(self.cache_write)
    }

    pub fn add(&mut self, other: &TokenCounts) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.cache_write = self.cache_write.saturating_add(other.cache_write);
    }
}

/// Local rows grouped by (date, model, billing mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalGroup {
    pub date: NaiveDate,
    pub model: String,
    pub billing_mode: BillingMode,
    pub tokens: TokenCounts,
    pub cost: f64,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalModelUsage {
    pub model: String,
    pub tokens: TokenCounts,
    pub cost: f64,
}

/// One period record from the authoritative source, already normalized.
///
/// There is no billing-mode split on this side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDay {
    pub date: NaiveDate,
    pub tokens: TokenCounts,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub models: Vec<ExternalModelUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalReport {
    pub period: ReportPeriod,
    pub days: Vec<ExternalDay>,
}

impl ExternalReport {
    pub fn empty(period: ReportPeriod) -> Self {
        Self {
            period,
            days: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn day(&self, date: NaiveDate) -> Option<&ExternalDay> {
        self.days.iter().find(|d| d.date == date)
    }

    /// Sum several reports (one per remote host) into one, per date and model.
    pub fn merge(period: ReportPeriod, reports: Vec<ExternalReport>) -> Self {
        let mut merged: std::collections::BTreeMap<NaiveDate, ExternalDay> = Default::default();
        for report in reports {
            for day in report.days {
                let slot = merged.entry(day.date).or_insert_with(|| ExternalDay {
                    date: day.date,
                    tokens: TokenCounts::default(),
                    total_tokens: 0,
                    total_cost: 0.0,
                    models: Vec::new(),
                });
                slot.tokens.add(&day.tokens);
                slot.total_tokens = slot.total_tokens.saturating_add(day.total_tokens);
                slot.total_cost += day.total_cost;
                for model in day.models {
                    match slot.models.iter_mut().find(|m| m.model == model.model) {
                        Some(existing) => {
                            existing.tokens.add(&model.tokens);
                            existing.cost += model.cost;
                        }
                        None => slot.models.push(model),
                    }
                }
            }
        }
        let mut days: Vec<ExternalDay> = merged.into_values().collect();
        for day in &mut days {
            day.models.sort_by(|a, b| a.model.cmp(&b.model));
        }
        Self { period, days }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Match,
    Minor,
    Major,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub date: NaiveDate,
    pub model: String,
    pub billing_mode: BillingMode,
    pub local_tokens: TokenCounts,
    pub local_total_tokens: u64,
    pub local_cost: f64,
    pub local_row_count: u64,
    /// Day totals from the authoritative source (shared by every entry of the date).
    pub external_tokens: TokenCounts,
    pub external_total_tokens: u64,
    pub external_cost: f64,
    pub token_discrepancy_pct: f64,
    pub cost_discrepancy_pct: f64,
    /// The worse of the two percentages above.
    pub discrepancy_pct: f64,
    pub status: AuditStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceTotals {
    pub tokens: TokenCounts,
    pub total_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTotals {
    pub local: SourceTotals,
    pub external: SourceTotals,
    /// local - external
    pub token_delta: i64,
    pub cost_delta: f64,
    pub token_discrepancy_pct: f64,
    pub cost_discrepancy_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelBreakdown {
    pub model: String,
    pub local_tokens: u64,
    pub local_cost: f64,
    pub local_entry_count: u64,
    pub external_tokens: u64,
    pub external_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingModeTotals {
    pub entry_count: u64,
    pub tokens: TokenCounts,
    pub local_cost: f64,
    /// Only accumulated for `max`: what this usage would have cost at the
    /// model's published API rates. Covers every token category (input,
    /// output, cache read and cache write), not just cache traffic. No
    /// local-cost counterpart exists.
    pub cache_savings: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingModeBreakdown {
    pub api: BillingModeTotals,
    pub max: BillingModeTotals,
}

impl BillingModeBreakdown {
    pub fn for_mode_mut(&mut self, mode: BillingMode) -> &mut BillingModeTotals {
        match mode {
            BillingMode::Api => &mut self.api,
            BillingMode::Max => &mut self.max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    TokenDiscrepancy,
    CostDiscrepancy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub message: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total: u64,
    #[serde(rename = "match")]
    pub matched: u64,
    pub minor: u64,
    pub major: u64,
    pub missing: u64,
}

impl AuditSummary {
    pub fn record(&mut self, status: AuditStatus) {
        self.total += 1;
        match status {
            AuditStatus::Match => self.matched += 1,
            AuditStatus::Minor => self.minor += 1,
            AuditStatus::Major => self.major += 1,
            AuditStatus::Missing => self.missing += 1,
        }
    }
}

/// Where the authoritative numbers came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthoritativeSource {
    Local,
    Remote { hosts: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResult {
    pub audit_type: AuditType,
    pub period: AuditPeriod,
    pub generated_at: DateTime<Utc>,
    pub source: AuthoritativeSource,
    pub totals: AuditTotals,
    pub entries: Vec<AuditEntry>,
    pub model_breakdown: Vec<ModelBreakdown>,
    pub billing_mode_breakdown: BillingModeBreakdown,
    pub anomalies: Vec<Anomaly>,
    pub summary: AuditSummary,
}

/// One persisted audit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSnapshot {
    pub id: i64,
    /// Epoch ms.
    pub created_at: i64,
    pub audit_type: AuditType,
    pub period: AuditPeriod,
    pub result: AuditResult,
}
