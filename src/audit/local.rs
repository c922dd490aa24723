//! Local side of the audit: read facts in the period and group them.

use super::types::{AuditPeriod, LocalGroup, TokenCounts};
use crate::db::Database;
use crate::error::StoreResult;
use crate::event_store::EventStore;
use crate::models::{BillingMode, QueryFilters, UsageFact};
use crate::pricing::normalize_model_id;
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostSource {
    Local,
    External,
    Legacy,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCost {
    pub value: f64,
    pub source: CostSource,
}

/// Prefer the locally computed cost, then the provider-reported one, then
/// the legacy single cost column.
pub fn resolve_cost(fact: &UsageFact) -> ResolvedCost {
    if let Some(value) = fact.local_cost {
        return ResolvedCost {
            value,
            source: CostSource::Local,
        };
    }
    if let Some(value) = fact.external_cost {
        return ResolvedCost {
            value,
            source: CostSource::External,
        };
    }
    if let Some(value) = fact.total_cost_usd {
        return ResolvedCost {
            value,
            source: CostSource::Legacy,
        };
    }
    ResolvedCost {
        value: 0.0,
        source: CostSource::None,
    }
}

/// Model a fact is reported under: the pricing model, then the provider's
/// model, then `unknown`.
pub fn resolve_model(fact: &UsageFact) -> String {
    fn non_blank(m: &Option<String>) -> Option<&str> {
        m.as_deref().filter(|m| !m.trim().is_empty())
    }
    let raw = non_blank(&fact.local_pricing_model)
        .or_else(|| non_blank(&fact.external_model))
        .unwrap_or("unknown");
    normalize_model_id(raw)
}

pub fn local_date(start_time_ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(start_time_ms)
        .map(|utc| utc.with_timezone(&Local).date_naive())
}

/// Epoch ms of local midnight starting `date`.
pub fn local_midnight_ms(date: NaiveDate) -> i64 {
    let naive = date.and_time(chrono::NaiveTime::MIN);
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.timestamp_millis(),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        // Midnight skipped by a DST jump; fall back to the UTC reading.
        chrono::LocalResult::None => naive.and_utc().timestamp_millis(),
    }
}

/// Group every fact in `period` by (local date, model, billing mode).
///
/// Groups come back ordered by date, then model, then billing mode.
pub fn query_local(db: &Database, period: &AuditPeriod) -> StoreResult<Vec<LocalGroup>> {
    let start_ms = local_midnight_ms(period.start);
    let end_ms = period
        .end
        .succ_opt()
        .map(local_midnight_ms)
        .unwrap_or(i64::MAX);

    let records =
        EventStore::new(db).query_between(start_ms, Some(end_ms), &QueryFilters::default())?;

    let mut groups: BTreeMap<(NaiveDate, String, BillingMode), LocalGroup> = BTreeMap::new();
    for record in &records {
        let fact = &record.fact;
        let Some(date) = local_date(fact.start_time) else {
            continue;
        };
        if !period.contains(date) {
            continue;
        }
        let model = resolve_model(fact);
        let billing_mode = fact.local_billing_mode.unwrap_or_default();

        let group = groups
            .entry((date, model.clone(), billing_mode))
            .or_insert_with(|| LocalGroup {
                date,
                model,
                billing_mode,
                tokens: TokenCounts::default(),
                cost: 0.0,
                row_count: 0,
            });
        group.tokens.add(&TokenCounts::new(
            fact.input_tokens.unwrap_or(0),
            fact.output_tokens.unwrap_or(0),
            fact.cache_read_tokens.unwrap_or(0),
            fact.cache_write_tokens.unwrap_or(0),
        ));
        group.cost += resolve_cost(fact).value;
        group.row_count += 1;
    }

    Ok(groups.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuerySource;

    fn fact() -> UsageFact {
        UsageFact::new("s1", "general", QuerySource::User, 0, 10)
    }

    #[test]
    fn test_resolve_cost_precedence() {
        let mut f = fact();
        assert_eq!(resolve_cost(&f).source, CostSource::None);
        assert_eq!(resolve_cost(&f).value, 0.0);

        f.total_cost_usd = Some(3.0);
        assert_eq!(resolve_cost(&f), ResolvedCost { value: 3.0, source: CostSource::Legacy });

        f.external_cost = Some(2.0);
        assert_eq!(resolve_cost(&f), ResolvedCost { value: 2.0, source: CostSource::External });

        f.local_cost = Some(1.0);
        assert_eq!(resolve_cost(&f), ResolvedCost { value: 1.0, source: CostSource::Local });
    }

    #[test]
    fn test_resolve_model_fallbacks() {
        let mut f = fact();
        assert_eq!(resolve_model(&f), "unknown");
        f.external_model = Some("claude-sonnet-4-5-20250929".into());
        assert_eq!(resolve_model(&f), "claude-sonnet-4-5");
        f.local_pricing_model = Some("claude-opus-4-5".into());
        assert_eq!(resolve_model(&f), "claude-opus-4-5");
    }

    #[test]
    fn test_blank_local_model_falls_through() {
        let mut f = fact();
        f.local_pricing_model = Some("  ".into());
        f.external_model = Some("claude-sonnet-4-5-20250929".into());
        assert_eq!(resolve_model(&f), "claude-sonnet-4-5");

        f.external_model = Some(String::new());
        assert_eq!(resolve_model(&f), "unknown");
    }

    #[test]
    fn test_local_midnight_round_trips_to_same_date() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let ms = local_midnight_ms(date);
        assert_eq!(local_date(ms), Some(date));
        assert_eq!(local_date(ms - 1), date.pred_opt());
    }
}
