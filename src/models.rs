//! Core Data Models
//!
//! This module defines the records that flow through the store and the
//! ephemeral rollups computed from them.
//!
//! ## Data Flow
//!
//! 1. **Raw Data**: [`UsageFact`] - one row per completed agent query cycle,
//!    written by the external producer through [`crate::event_store::EventStore`]
//! 2. **Stored Data**: [`UsageRecord`] - a fact plus its generated identity
//! 3. **Rollups**: [`StatsAggregation`] - dashboard snapshot rebuilt on every request
//!
//! Audit types live in [`crate::audit::types`].
//!
//! ## Wire format
//!
//! Every public type serializes with camelCase field names; the dashboard layer
//! consumes them as-is.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Who triggered a query cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySource {
    User,
    Auto,
}

impl QuerySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuerySource::User => "user",
            QuerySource::Auto => "auto",
        }
    }
}

impl FromStr for QuerySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(QuerySource::User),
            "auto" => Ok(QuerySource::Auto),
            other => Err(format!("unknown query source: {other}")),
        }
    }
}

impl fmt::Display for QuerySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tariff a query was charged under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingMode {
    /// Metered per token.
    #[default]
    Api,
    /// Flat-rate subscription; cache traffic is not metered.
    Max,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMode::Api => "api",
            BillingMode::Max => "max",
        }
    }
}

impl FromStr for BillingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(BillingMode::Api),
            "max" => Ok(BillingMode::Max),
            other => Err(format!("unknown billing mode: {other}")),
        }
    }
}

impl fmt::Display for BillingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed agent query cycle as emitted by the producer.
///
/// Token counts are `None` when the producer could not determine them; that
/// is different from a count of zero and aggregation treats it so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageFact {
    pub session_id: String,
    pub agent_type: String,
    pub source: QuerySource,
    /// Epoch milliseconds.
    pub start_time: i64,
    pub duration_ms: u64,
    pub project_path: Option<String>,
    pub is_remote: bool,

    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
    pub tokens_per_second: Option<f64>,

    /// Single cost column written before dual-source tracking existed.
    pub total_cost_usd: Option<f64>,

    pub external_cost: Option<f64>,
    pub external_model: Option<String>,
    pub local_cost: Option<f64>,
    pub local_billing_mode: Option<BillingMode>,
    pub local_pricing_model: Option<String>,
    pub local_calculated_at: Option<i64>,

    pub uuid: Option<String>,
    pub external_message_id: Option<String>,
    pub is_reconstructed: bool,
    pub reconstructed_at: Option<i64>,
    pub external_session_id: Option<String>,
}

impl UsageFact {
    /// A fact with every optional field absent.
    pub fn new(
        session_id: impl Into<String>,
        agent_type: impl Into<String>,
        source: QuerySource,
        start_time: i64,
        duration_ms: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_type: agent_type.into(),
            source,
            start_time,
            duration_ms,
            project_path: None,
            is_remote: false,
            input_tokens: None,
            output_tokens: None,
            cache_read_tokens: None,
            cache_write_tokens: None,
            tokens_per_second: None,
            total_cost_usd: None,
            external_cost: None,
            external_model: None,
            local_cost: None,
            local_billing_mode: None,
            local_pricing_model: None,
            local_calculated_at: None,
            uuid: None,
            external_message_id: None,
            is_reconstructed: false,
            reconstructed_at: None,
            external_session_id: None,
        }
    }

    /// Reject values the schema cannot represent faithfully.
    pub fn validate(&self) -> Result<(), String> {
        if self.session_id.trim().is_empty() {
            return Err("session id is empty".to_string());
        }
        if self.agent_type.trim().is_empty() {
            return Err("agent type is empty".to_string());
        }
        if self.duration_ms > i64::MAX as u64 {
            return Err(format!("duration {} out of range", self.duration_ms));
        }
        let counts = [
            ("inputTokens", self.input_tokens),
            ("outputTokens", self.output_tokens),
            ("cacheReadTokens", self.cache_read_tokens),
            ("cacheWriteTokens", self.cache_write_tokens),
        ];
        for (name, value) in counts {
            if value.map(|v| v > i64::MAX as u64).unwrap_or(false) {
                return Err(format!("{name} out of range"));
            }
        }
        let reals = [
            ("tokensPerSecond", self.tokens_per_second),
            ("totalCostUsd", self.total_cost_usd),
            ("externalCost", self.external_cost),
            ("localCost", self.local_cost),
        ];
        for (name, value) in reals {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{name} must be finite and non-negative, got {v}"));
                }
            }
        }
        Ok(())
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.unwrap_or(0)
            + self.output_tokens.unwrap_or(0)
            + self.cache_read_tokens.unwrap_or(0)
            + self.cache_write_tokens.unwrap_or(0)
    }
}

/// A stored fact with its generated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: String,
    #[serde(flatten)]
    pub fact: UsageFact,
}

/// Dashboard time window, resolved once per request to an absolute bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Day,
    #[default]
    Week,
    Month,
    Quarter,
    Year,
    All,
}

impl TimeRange {
    /// Lower bound in epoch ms relative to `now_ms`.
    pub fn lower_bound_from(&self, now_ms: i64) -> i64 {
        let span = match self {
            TimeRange::Day => Duration::days(1),
            TimeRange::Week => Duration::days(7),
            TimeRange::Month => Duration::days(30),
            TimeRange::Quarter => Duration::days(90),
            TimeRange::Year => Duration::days(365),
            TimeRange::All => return 0,
        };
        (now_ms - span.num_milliseconds()).max(0)
    }

    pub fn lower_bound(&self) -> i64 {
        self.lower_bound_from(Utc::now().timestamp_millis())
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(TimeRange::Day),
            "week" => Ok(TimeRange::Week),
            "month" => Ok(TimeRange::Month),
            "quarter" => Ok(TimeRange::Quarter),
            "year" => Ok(TimeRange::Year),
            "all" => Ok(TimeRange::All),
            other => Err(format!(
                "unknown time range: {other} (expected day, week, month, quarter, year or all)"
            )),
        }
    }
}

/// Optional equality filters for [`crate::event_store::EventStore::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilters {
    pub agent_type: Option<String>,
    pub source: Option<QuerySource>,
    pub project_path: Option<String>,
    pub session_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Aggregation output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub count: u64,
    pub duration: u64,
    pub total_output_tokens: u64,
    /// Mean throughput over this agent's rows with known output tokens.
    pub avg_tokens_per_second: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakdown {
    pub user: u64,
    pub auto: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationBreakdown {
    pub local: u64,
    pub remote: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStats {
    pub date: String,
    pub count: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourStats {
    pub hour: u8,
    pub count: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayCount {
    pub date: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLifecycle {
    pub total_sessions: u64,
    pub sessions_by_agent: BTreeMap<String, u64>,
    pub sessions_by_day: Vec<DayCount>,
    /// Mean of (last query end - first query start) across sessions, in ms.
    pub avg_session_duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetrics {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_write_tokens: u64,
    pub avg_tokens_per_second: f64,
    pub avg_output_tokens_per_query: f64,
    /// Rows the averages above were computed over.
    pub queries_with_token_data: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsAggregation {
    pub since: i64,
    pub total_queries: u64,
    pub total_duration: u64,
    pub avg_duration: f64,
    pub by_agent: BTreeMap<String, AgentStats>,
    pub by_source: SourceBreakdown,
    pub by_location: LocationBreakdown,
    pub by_day: Vec<DayStats>,
    pub by_agent_by_day: BTreeMap<String, Vec<DayStats>>,
    pub by_hour: Vec<HourStats>,
    pub sessions: SessionLifecycle,
    pub by_session_by_day: BTreeMap<String, Vec<DayStats>>,
    pub tokens: TokenMetrics,
    pub query_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_bounds() {
        let now = 10 * 24 * 60 * 60 * 1000;
        assert_eq!(TimeRange::All.lower_bound_from(now), 0);
        assert_eq!(TimeRange::Day.lower_bound_from(now), 9 * 24 * 60 * 60 * 1000);
        assert_eq!(TimeRange::Week.lower_bound_from(now), 3 * 24 * 60 * 60 * 1000);
        assert_eq!(TimeRange::Year.lower_bound_from(now), 0);
    }

    #[test]
    fn test_validate_rejects_negative_cost() {
        let mut fact = UsageFact::new("s1", "claude-code", QuerySource::User, 0, 10);
        assert!(fact.validate().is_ok());
        fact.local_cost = Some(-0.5);
        assert!(fact.validate().is_err());
        fact.local_cost = Some(f64::NAN);
        assert!(fact.validate().is_err());
    }

    #[test]
    fn test_fact_serializes_camel_case() {
        let fact = UsageFact::new("s1", "claude-code", QuerySource::Auto, 5, 10);
        let json = serde_json::to_value(&fact).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["source"], "auto");
        assert!(json["outputTokens"].is_null());
    }
}
