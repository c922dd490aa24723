//! Durable audit history.
//!
//! Headline figures are flattened into columns for cheap listing; the full
//! [`AuditResult`] is kept as JSON in `payload` and is what readers get back.

use super::types::{AuditPeriod, AuditResult, AuditSnapshot, AuditType};
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Row};
use tracing::info;

const INSERT_SQL: &str = "INSERT INTO audit_snapshots (
        created_at, period_start, period_end, audit_type,
        local_input_tokens, local_output_tokens, local_cache_read_tokens, local_cache_write_tokens,
        local_total_cost,
        external_input_tokens, external_output_tokens, external_cache_read_tokens,
        external_cache_write_tokens, external_total_cost,
        token_discrepancy_pct, cost_discrepancy_pct,
        entry_count, match_count, minor_count, major_count, missing_count, anomaly_count,
        payload
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
        ?20, ?21, ?22, ?23
    )";

const SELECT_SQL: &str =
    "SELECT id, created_at, audit_type, period_start, period_end, payload FROM audit_snapshots";

pub struct SnapshotStore<'a> {
    db: &'a Database,
}

impl<'a> SnapshotStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Persist one audit result; returns the snapshot id.
    pub fn save_snapshot(&self, result: &AuditResult) -> StoreResult<i64> {
        let payload = serde_json::to_string(result)?;
        let created_at = Utc::now().timestamp_millis();
        let local = &result.totals.local;
        let external = &result.totals.external;
        let summary = &result.summary;

        let id = self.db.with_conn(|conn| {
            conn.prepare_cached(INSERT_SQL)?.execute(params![
                created_at,
                result.period.start.to_string(),
                result.period.end.to_string(),
                result.audit_type.as_str(),
                sql_count(local.tokens.input),
                sql_count(local.tokens.output),
                sql_count(local.tokens.cache_read),
                sql_count(local.tokens.cache_write),
                local.cost,
                sql_count(external.tokens.input),
                sql_count(external.tokens.output),
                sql_count(external.tokens.cache_read),
                sql_count(external.tokens.cache_write),
                external.cost,
                result.totals.token_discrepancy_pct,
                result.totals.cost_discrepancy_pct,
                sql_count(summary.total),
                sql_count(summary.matched),
                sql_count(summary.minor),
                sql_count(summary.major),
                sql_count(summary.missing),
                sql_count(result.anomalies.len() as u64),
                payload,
            ])?;
            Ok(conn.last_insert_rowid())
        })?;

        info!(
            snapshot_id = id,
            audit_type = %result.audit_type,
            period_start = %result.period.start,
            period_end = %result.period.end,
            entries = summary.total,
            "Saved audit snapshot"
        );
        Ok(id)
    }

    /// Most recent snapshots first.
    pub fn get_history(&self, limit: usize) -> StoreResult<Vec<AuditSnapshot>> {
        let sql = format!("{SELECT_SQL} ORDER BY created_at DESC, id DESC LIMIT ?1");
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([limit], read_raw)?;
            collect_snapshots(rows)
        })
    }

    /// Snapshots whose audited period overlaps `[start, end]`, most recent first.
    pub fn get_snapshots_by_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<AuditSnapshot>> {
        let sql = format!(
            "{SELECT_SQL} WHERE period_start <= ?2 AND period_end >= ?1 ORDER BY created_at DESC, id DESC"
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![start.to_string(), end.to_string()], read_raw)?;
            collect_snapshots(rows)
        })
    }

    pub fn latest_snapshot(&self) -> StoreResult<Option<AuditSnapshot>> {
        Ok(self.get_history(1)?.into_iter().next())
    }

    pub fn get_snapshot(&self, id: i64) -> StoreResult<Option<AuditSnapshot>> {
        let sql = format!("{SELECT_SQL} WHERE id = ?1");
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([id], read_raw)?;
            Ok(collect_snapshots(rows)?.into_iter().next())
        })
    }
}

fn sql_count(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

struct RawSnapshot {
    id: i64,
    created_at: i64,
    audit_type: String,
    period_start: String,
    period_end: String,
    payload: String,
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawSnapshot> {
    Ok(RawSnapshot {
        id: row.get(0)?,
        created_at: row.get(1)?,
        audit_type: row.get(2)?,
        period_start: row.get(3)?,
        period_end: row.get(4)?,
        payload: row.get(5)?,
    })
}

fn collect_snapshots<I>(rows: I) -> StoreResult<Vec<AuditSnapshot>>
where
    I: Iterator<Item = rusqlite::Result<RawSnapshot>>,
{
    let mut out = Vec::new();
    for raw in rows {
        out.push(decode(raw?)?);
    }
    Ok(out)
}

fn decode(raw: RawSnapshot) -> StoreResult<AuditSnapshot> {
    let corrupt = |message: String| StoreError::CorruptRow {
        table: "audit_snapshots",
        message,
    };
    let audit_type: AuditType = raw.audit_type.parse().map_err(corrupt)?;
    let start = raw
        .period_start
        .parse::<NaiveDate>()
        .map_err(|e| corrupt(format!("period_start: {e}")))?;
    let end = raw
        .period_end
        .parse::<NaiveDate>()
        .map_err(|e| corrupt(format!("period_end: {e}")))?;
    let result: AuditResult = serde_json::from_str(&raw.payload)?;

    Ok(AuditSnapshot {
        id: raw.id,
        created_at: raw.created_at,
        audit_type,
        period: AuditPeriod::new(start, end),
        result,
    })
}
