//! Pure reconciliation of local groups against an authoritative report.
//!
//! ## Classification
//!
//! Each local group is compared against the authoritative *day total* for
//! its date, on tokens and on cost:
//!
//! ```text
//! token% = |local - external| * 100 / max(local, external, 1)
//! cost%  = |local - external| * 100 / max(local, external, 0.001)
//! ```
//!
//! The worse of the two decides the status: `<= 1` match, `<= 5` minor,
//! above that major. A group whose date has no authoritative record is
//! `missing`.
//!
//! ## Determinism
//!
//! The result depends only on the inputs and the supplied `generated_at`;
//! entries and breakdowns come out in a stable order.

use super::types::{
    Anomaly, AnomalyKind, AnomalySeverity, AuditEntry, AuditPeriod, AuditResult, AuditStatus,
    AuditSummary, AuditTotals, AuthoritativeSource, AuditType, BillingModeBreakdown,
    ExternalReport, LocalGroup, ModelBreakdown, SourceTotals, TokenCounts,
};
use crate::models::BillingMode;
use crate::pricing::PricingLookup;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;

pub const MATCH_THRESHOLD_PCT: f64 = 1.0;
pub const MINOR_THRESHOLD_PCT: f64 = 5.0;

/// Anomalies are raised on whole-period totals above these percentages.
pub const WARNING_THRESHOLD_PCT: f64 = 1.0;
pub const ERROR_THRESHOLD_PCT: f64 = 5.0;

const TOKEN_FLOOR: f64 = 1.0;
const COST_FLOOR: f64 = 0.001;

fn relative_pct(local: f64, external: f64, floor: f64) -> f64 {
    (local - external).abs() * 100.0 / local.max(external).max(floor)
}

pub fn token_discrepancy_pct(local: u64, external: u64) -> f64 {
    let diff = local.abs_diff(external) as f64;
    diff * 100.0 / (local.max(external) as f64).max(TOKEN_FLOOR)
}

pub fn cost_discrepancy_pct(local: f64, external: f64) -> f64 {
    relative_pct(local, external, COST_FLOOR)
}

pub fn classify(discrepancy_pct: f64) -> AuditStatus {
    if discrepancy_pct <= MATCH_THRESHOLD_PCT {
        AuditStatus::Match
    } else if discrepancy_pct <= MINOR_THRESHOLD_PCT {
        AuditStatus::Minor
    } else {
        AuditStatus::Major
    }
}

pub struct ReconcileInput<'a> {
    pub audit_type: AuditType,
    pub period: AuditPeriod,
    pub generated_at: DateTime<Utc>,
    pub source: AuthoritativeSource,
    pub local: &'a [LocalGroup],
    pub external: &'a ExternalReport,
    pub pricing: &'a dyn PricingLookup,
}

pub fn reconcile(input: ReconcileInput<'_>) -> AuditResult {
    let ReconcileInput {
        audit_type,
        period,
        generated_at,
        source,
        local,
        external,
        pricing,
    } = input;

    let external_days: Vec<_> = external
        .days
        .iter()
        .filter(|d| period.contains(d.date))
        .collect();

    let mut entries = Vec::with_capacity(local.len());
    let mut summary = AuditSummary::default();
    let mut billing = BillingModeBreakdown::default();
    let mut models: BTreeMap<String, ModelBreakdown> = BTreeMap::new();
    let mut local_totals = SourceTotals::default();

    for group in local {
        let local_total_tokens = group.tokens.total();
        let entry = match external_days.iter().find(|d| d.date == group.date) {
            Some(day) => {
                let token_pct = token_discrepancy_pct(local_total_tokens, day.total_tokens);
                let cost_pct = cost_discrepancy_pct(group.cost, day.total_cost);
                let worst = token_pct.max(cost_pct);
                AuditEntry {
                    date: group.date,
                    model: group.model.clone(),
                    billing_mode: group.billing_mode,
                    local_tokens: group.tokens,
                    local_total_tokens,
                    local_cost: group.cost,
                    local_row_count: group.row_count,
                    external_tokens: day.tokens,
                    external_total_tokens: day.total_tokens,
                    external_cost: day.total_cost,
                    token_discrepancy_pct: token_pct,
                    cost_discrepancy_pct: cost_pct,
                    discrepancy_pct: worst,
                    status: classify(worst),
                }
            }
            None => AuditEntry {
                date: group.date,
                model: group.model.clone(),
                billing_mode: group.billing_mode,
                local_tokens: group.tokens,
                local_total_tokens,
                local_cost: group.cost,
                local_row_count: group.row_count,
                external_tokens: TokenCounts::default(),
                external_total_tokens: 0,
                external_cost: 0.0,
                token_discrepancy_pct: 100.0,
                cost_discrepancy_pct: 100.0,
                discrepancy_pct: 100.0,
                status: AuditStatus::Missing,
            },
        };

        summary.record(entry.status);

        local_totals.tokens.add(&group.tokens);
        local_totals.total_tokens = local_totals.total_tokens.saturating_add(local_total_tokens);
        local_totals.cost += group.cost;

        let mode = billing.for_mode_mut(group.billing_mode);
        mode.entry_count += 1;
        mode.tokens.add(&group.tokens);
        mode.local_cost += group.cost;
        if group.billing_mode == BillingMode::Max {
            if let Some(rates) = pricing.rates(&group.model) {
                mode.cache_savings += rates.cost(
                    group.tokens.input,
                    group.tokens.output,
                    group.tokens.cache_read,
                    group.tokens.cache_write,
                );
            }
        }

        let model = models
            .entry(group.model.clone())
            .or_insert_with(|| ModelBreakdown {
                model: group.model.clone(),
                ..ModelBreakdown::default()
            });
        model.local_tokens = model.local_tokens.saturating_add(local_total_tokens);
        model.local_cost += group.cost;
        model.local_entry_count += 1;

        entries.push(entry);
    }

    let mut external_totals = SourceTotals::default();
    for day in &external_days {
        external_totals.tokens.add(&day.tokens);
        external_totals.total_tokens = external_totals.total_tokens.saturating_add(day.total_tokens);
        external_totals.cost += day.total_cost;

        for usage in &day.models {
            let model = models
                .entry(usage.model.clone())
                .or_insert_with(|| ModelBreakdown {
                    model: usage.model.clone(),
                    ..ModelBreakdown::default()
                });
            model.external_tokens = model.external_tokens.saturating_add(usage.tokens.total());
            model.external_cost += usage.cost;
        }
    }

    let totals = AuditTotals {
        token_delta: signed_delta(local_totals.total_tokens, external_totals.total_tokens),
        cost_delta: local_totals.cost - external_totals.cost,
        token_discrepancy_pct: token_discrepancy_pct(
            local_totals.total_tokens,
            external_totals.total_tokens,
        ),
        cost_discrepancy_pct: cost_discrepancy_pct(local_totals.cost, external_totals.cost),
        local: local_totals,
        external: external_totals,
    };

    let anomalies = detect_anomalies(&totals);

    AuditResult {
        audit_type,
        period,
        generated_at,
        source,
        totals,
        entries,
        model_breakdown: models.into_values().collect(),
        billing_mode_breakdown: billing,
        anomalies,
        summary,
    }
}

fn signed_delta(local: u64, external: u64) -> i64 {
    let delta = i128::from(local) - i128::from(external);
    delta.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

fn severity_for(pct: f64) -> Option<AnomalySeverity> {
    if pct > ERROR_THRESHOLD_PCT {
        Some(AnomalySeverity::Error)
    } else if pct > WARNING_THRESHOLD_PCT {
        Some(AnomalySeverity::Warning)
    } else {
        None
    }
}

fn detect_anomalies(totals: &AuditTotals) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    if let Some(severity) = severity_for(totals.token_discrepancy_pct) {
        anomalies.push(Anomaly {
            kind: AnomalyKind::TokenDiscrepancy,
            severity,
            message: format!(
                "Local token total differs from authoritative usage by {:.2}%",
                totals.token_discrepancy_pct
            ),
            details: json!({
                "localTokens": totals.local.total_tokens,
                "externalTokens": totals.external.total_tokens,
                "delta": totals.token_delta,
                "percent": totals.token_discrepancy_pct,
            }),
        });
    }

    if let Some(severity) = severity_for(totals.cost_discrepancy_pct) {
        anomalies.push(Anomaly {
            kind: AnomalyKind::CostDiscrepancy,
            severity,
            message: format!(
                "Local cost differs from authoritative cost by {:.2}%",
                totals.cost_discrepancy_pct
            ),
            details: json!({
                "localCost": totals.local.cost,
                "externalCost": totals.external.cost,
                "delta": totals.cost_delta,
                "percent": totals.cost_discrepancy_pct,
            }),
        });
    }

    anomalies
}
