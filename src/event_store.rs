//! Append-mostly store for usage facts.
//!
//! Inserts go through a cached prepared statement; the cache lives on the
//! connection and is flushed by [`Database::reopen`]. No update or delete is
//! offered here.

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{BillingMode, QueryFilters, QuerySource, TimeRange, UsageFact, UsageRecord};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Row};
use tracing::debug;
use uuid::Uuid;

const INSERT_SQL: &str = "INSERT INTO query_events (
        id, session_id, agent_type, source, start_time, duration, project_path, is_remote,
        input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, tokens_per_second,
        total_cost_usd, external_cost, external_model, local_cost, local_billing_mode,
        local_pricing_model, local_calculated_at, uuid, external_message_id, is_reconstructed,
        reconstructed_at, external_session_id
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
        ?20, ?21, ?22, ?23, ?24, ?25
    )";

const SELECT_COLUMNS: &str = "id, session_id, agent_type, source, start_time, duration, project_path,
        is_remote, input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
        tokens_per_second, total_cost_usd, external_cost, external_model, local_cost,
        local_billing_mode, local_pricing_model, local_calculated_at, uuid, external_message_id,
        is_reconstructed, reconstructed_at, external_session_id";

pub struct EventStore<'a> {
    db: &'a Database,
}

impl<'a> EventStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Store one fact and return its generated identity.
    pub fn insert(&self, fact: &UsageFact) -> StoreResult<String> {
        fact.validate().map_err(StoreError::InvalidFact)?;

        let id = Uuid::new_v4().to_string();
        let project_path = fact.project_path.as_deref().and_then(canonical_project_path);

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(INSERT_SQL)?;
            stmt.execute(params![
                id,
                fact.session_id,
                fact.agent_type,
                fact.source.as_str(),
                fact.start_time,
                to_sql_int(fact.duration_ms),
                project_path,
                fact.is_remote,
                fact.input_tokens.map(to_sql_int),
                fact.output_tokens.map(to_sql_int),
                fact.cache_read_tokens.map(to_sql_int),
                fact.cache_write_tokens.map(to_sql_int),
                fact.tokens_per_second,
                fact.total_cost_usd,
                fact.external_cost,
                fact.external_model,
                fact.local_cost,
                fact.local_billing_mode.map(|m| m.as_str()),
                fact.local_pricing_model,
                fact.local_calculated_at,
                fact.uuid,
                fact.external_message_id,
                fact.is_reconstructed,
                fact.reconstructed_at,
                fact.external_session_id,
            ])?;
            Ok(())
        })?;

        debug!(id = %id, session_id = %fact.session_id, agent_type = %fact.agent_type, "Inserted usage fact");
        Ok(id)
    }

    /// Facts newer than the range's lower bound, most recent first.
    pub fn query(&self, range: TimeRange, filters: &QueryFilters) -> StoreResult<Vec<UsageRecord>> {
        self.query_between(range.lower_bound(), None, filters)
    }

    /// Facts with `start_ms <= start_time` (and `< end_ms` when given).
    pub fn query_between(
        &self,
        start_ms: i64,
        end_ms: Option<i64>,
        filters: &QueryFilters,
    ) -> StoreResult<Vec<UsageRecord>> {
        let mut clauses = vec!["start_time >= ?1".to_string()];
        let mut values: Vec<Value> = vec![Value::Integer(start_ms)];

        let mut push = |clause: &str, value: Value| {
            values.push(value);
            clauses.push(format!("{clause} ?{}", values.len()));
        };

        if let Some(end) = end_ms {
            push("start_time <", Value::Integer(end));
        }
        if let Some(agent) = &filters.agent_type {
            push("agent_type =", Value::Text(agent.clone()));
        }
        if let Some(source) = filters.source {
            push("source =", Value::Text(source.as_str().to_string()));
        }
        if let Some(path) = filters.project_path.as_deref().and_then(canonical_project_path) {
            push("project_path =", Value::Text(path));
        }
        if let Some(session) = &filters.session_id {
            push("session_id =", Value::Text(session.clone()));
        }

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM query_events WHERE {} ORDER BY start_time DESC, id ASC",
            clauses.join(" AND ")
        );

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), read_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn count(&self, range: TimeRange) -> StoreResult<u64> {
        let since = range.lower_bound();
        self.db.with_conn(|conn| {
            let n: i64 = conn
                .prepare_cached("SELECT COUNT(*) FROM query_events WHERE start_time >= ?1")?
                .query_row([since], |r| r.get(0))?;
            Ok(n.max(0) as u64)
        })
    }
}

/// Normalize separators and trailing slashes so the same project always
/// compares equal. Returns `None` for empty paths.
pub fn canonical_project_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let mut collapsed = String::with_capacity(unified.len());
    let mut prev_slash = false;
    for ch in unified.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        collapsed.push(ch);
    }

    let trimmed = collapsed.trim_end_matches('/');
    if trimmed.is_empty() {
        if collapsed.starts_with('/') {
            return Some("/".to_string());
        }
        return None;
    }
    Some(trimmed.to_string())
}

// Values are range-checked in UsageFact::validate.
fn to_sql_int(v: u64) -> i64 {
    v as i64
}

fn from_sql_int(v: Option<i64>) -> Option<u64> {
    v.map(|n| n.max(0) as u64)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    let source: String = row.get(3)?;
    let source = source.parse::<QuerySource>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    let billing: Option<String> = row.get(17)?;
    let local_billing_mode = billing
        .map(|b| b.parse::<BillingMode>())
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(17, rusqlite::types::Type::Text, e.into())
        })?;

    Ok(UsageRecord {
        id: row.get(0)?,
        fact: UsageFact {
            session_id: row.get(1)?,
            agent_type: row.get(2)?,
            source,
            start_time: row.get(4)?,
            duration_ms: row.get::<_, i64>(5)?.max(0) as u64,
            project_path: row.get(6)?,
            is_remote: row.get(7)?,
            input_tokens: from_sql_int(row.get(8)?),
            output_tokens: from_sql_int(row.get(9)?),
            cache_read_tokens: from_sql_int(row.get(10)?),
            cache_write_tokens: from_sql_int(row.get(11)?),
            tokens_per_second: row.get(12)?,
            total_cost_usd: row.get(13)?,
            external_cost: row.get(14)?,
            external_model: row.get(15)?,
            local_cost: row.get(16)?,
            local_billing_mode,
            local_pricing_model: row.get(18)?,
            local_calculated_at: row.get(19)?,
            uuid: row.get(20)?,
            external_message_id: row.get(21)?,
            is_reconstructed: row.get(22)?,
            reconstructed_at: row.get(23)?,
            external_session_id: row.get(24)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_project_path() {
        assert_eq!(
            canonical_project_path("C:\\work\\app\\").as_deref(),
            Some("C:/work/app")
        );
        assert_eq!(
            canonical_project_path("/home/me//repo/").as_deref(),
            Some("/home/me/repo")
        );
        assert_eq!(canonical_project_path("/").as_deref(), Some("/"));
        assert_eq!(canonical_project_path("   "), None);
    }
}
