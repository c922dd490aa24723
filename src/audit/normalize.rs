//! Boundary between the external tool's JSON and the canonical audit shape.
//!
//! Field-name drift (camelCase, snake_case, `costUSD`, ...) is absorbed by
//! serde aliases on private raw types; nothing past [`parse_report`] sees a
//! raw name.

use super::types::{ExternalDay, ExternalModelUsage, ExternalReport, ReportPeriod, TokenCounts};
use crate::error::ExternalError;
use crate::pricing::normalize_model_id;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};

const MISSING_HISTORY_MARKERS: &[&str] = &[
    "no valid claude data directories found",
    "no claude usage data found",
    "no usage data found",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPeriod {
    #[serde(alias = "week", alias = "month", alias = "period")]
    date: String,
    #[serde(default, alias = "input_tokens", deserialize_with = "lenient_count")]
    input_tokens: u64,
    #[serde(default, alias = "output_tokens", deserialize_with = "lenient_count")]
    output_tokens: u64,
    #[serde(
        default,
        alias = "cache_read_tokens",
        alias = "cacheReadInputTokens",
        alias = "cache_read_input_tokens",
        deserialize_with = "lenient_count"
    )]
    cache_read_tokens: u64,
    #[serde(
        default,
        alias = "cache_creation_tokens",
        alias = "cacheCreationInputTokens",
        alias = "cache_creation_input_tokens",
        alias = "cacheWriteTokens",
        alias = "cache_write_tokens",
        deserialize_with = "lenient_count"
    )]
    cache_creation_tokens: u64,
    #[serde(default, alias = "total_tokens", deserialize_with = "lenient_optional_count")]
    total_tokens: Option<u64>,
    #[serde(
        default,
        alias = "total_cost",
        alias = "costUSD",
        alias = "cost_usd",
        alias = "totalCostUSD",
        alias = "cost",
        deserialize_with = "lenient_cost"
    )]
    total_cost: f64,
    #[serde(default, alias = "model_breakdowns")]
    model_breakdowns: Vec<RawModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawModel {
    #[serde(alias = "model", alias = "model_name")]
    model_name: String,
    #[serde(default, alias = "input_tokens", deserialize_with = "lenient_count")]
    input_tokens: u64,
    #[serde(default, alias = "output_tokens", deserialize_with = "lenient_count")]
    output_tokens: u64,
    #[serde(
        default,
        alias = "cache_read_tokens",
        alias = "cacheReadInputTokens",
        alias = "cache_read_input_tokens",
        deserialize_with = "lenient_count"
    )]
    cache_read_tokens: u64,
    #[serde(
        default,
        alias = "cache_creation_tokens",
        alias = "cacheCreationInputTokens",
        alias = "cache_creation_input_tokens",
        alias = "cacheWriteTokens",
        alias = "cache_write_tokens",
        deserialize_with = "lenient_count"
    )]
    cache_creation_tokens: u64,
    #[serde(
        default,
        alias = "total_cost",
        alias = "costUSD",
        alias = "cost_usd",
        alias = "totalCostUSD",
        alias = "cost",
        deserialize_with = "lenient_cost"
    )]
    total_cost: f64,
}

// Counts sometimes arrive as floats or null.
fn lenient_count<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    Ok(lenient_optional_count(d)?.unwrap_or(0))
}

fn lenient_optional_count<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    let value = Option::<f64>::deserialize(d)?;
    Ok(value.map(|v| if v.is_finite() && v > 0.0 { v.round() as u64 } else { 0 }))
}

fn lenient_cost<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let value = Option::<f64>::deserialize(d)?;
    Ok(value.filter(|v| v.is_finite()).unwrap_or(0.0))
}

/// First `max_chars` characters of `text`, for error reporting.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// True when the first non-whitespace character opens a JSON object or array.
pub fn looks_like_json(stdout: &str) -> bool {
    matches!(stdout.trim_start().chars().next(), Some('{') | Some('['))
}

/// True when the tool reports that there is no usage history on this machine.
pub fn mentions_missing_history(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    MISSING_HISTORY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Parse `YYYY-MM-DD`, `YYYYMMDD` or `YYYY-MM` (first of the month).
pub fn parse_period_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y%m%d"))
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d").ok())
}

/// Sniff, parse and normalize the tool's stdout.
///
/// The records live under a key named after the period (`daily`, `weekly`,
/// `monthly`); a bare top-level array is accepted too. An object with no
/// such key is an empty report.
pub fn parse_report(
    stdout: &str,
    period: ReportPeriod,
    excerpt_chars: usize,
) -> Result<ExternalReport, ExternalError> {
    let malformed = || ExternalError::MalformedOutput {
        excerpt: excerpt(stdout, excerpt_chars),
    };

    if !looks_like_json(stdout) {
        return Err(malformed());
    }

    let value: serde_json::Value = serde_json::from_str(stdout).map_err(|_| malformed())?;
    let records = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove(period.as_str()) {
            Some(serde_json::Value::Array(items)) => items,
            Some(_) => return Err(malformed()),
            None => Vec::new(),
        },
        _ => return Err(malformed()),
    };

    let mut days = Vec::with_capacity(records.len());
    for record in records {
        let raw: RawPeriod = serde_json::from_value(record).map_err(|_| malformed())?;
        days.push(normalize_period(raw).ok_or_else(malformed)?);
    }
    days.sort_by_key(|d| d.date);

    Ok(ExternalReport { period, days })
}

// `None` for an unparseable date or token counts that overflow a `u64`.
fn normalize_period(raw: RawPeriod) -> Option<ExternalDay> {
    let date = parse_period_date(&raw.date)?;
    let tokens = TokenCounts::new(
        raw.input_tokens,
        raw.output_tokens,
        raw.cache_read_tokens,
        raw.cache_creation_tokens,
    );
    let component_total = tokens.checked_total()?;

    let mut models: Vec<ExternalModelUsage> = Vec::with_capacity(raw.model_breakdowns.len());
    for m in raw.model_breakdowns {
        let model = normalize_model_id(&m.model_name);
        let usage = TokenCounts::new(
            m.input_tokens,
            m.output_tokens,
            m.cache_read_tokens,
            m.cache_creation_tokens,
        );
        usage.checked_total()?;
        match models.iter_mut().find(|existing| existing.model == model) {
            Some(existing) => {
                existing.tokens.add(&usage);
                existing.cost += m.total_cost;
            }
            None => models.push(ExternalModelUsage {
                model,
                tokens: usage,
                cost: m.total_cost,
            }),
        }
    }
    models.sort_by(|a, b| a.model.cmp(&b.model));

    Some(ExternalDay {
        date,
        total_tokens: raw.total_tokens.unwrap_or(component_total),
        tokens,
        total_cost: raw.total_cost,
        models,
    })
}
