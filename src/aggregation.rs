//! Dashboard Aggregation Engine
//!
//! Builds a [`StatsAggregation`] from the `query_events` table. The requested
//! [`TimeRange`] is resolved to a single absolute lower bound *before* any
//! query runs, and every sub-aggregation binds that same value, so the
//! breakdowns always add up to the totals even if the clock moves mid-call.
//!
//! ## Sub-aggregations
//!
//! Each is an independent read with no dependency on another's result:
//!
//! - totals, by agent, by source, by location (local/remote)
//! - by day, by agent by day, by hour of day
//! - session lifecycle (distinct sessions, per agent, per day, mean span)
//! - by session by day
//! - token metrics
//!
//! ## Partial token coverage
//!
//! Older facts have no token counts. Throughput averages are taken only over
//! rows whose `output_tokens` is known, and the number of such rows is
//! returned as `queriesWithTokenData` so the dashboard can say "based on N of
//! M queries" instead of blending known and unknown data.
//!
//! ## Performance
//!
//! Total wall time is measured. Crossing the configured threshold logs a
//! warning; the result is still returned in full.

use crate::db::Database;
use crate::error::StoreResult;
use crate::models::*;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DAY_EXPR: &str = "date(start_time / 1000, 'unixepoch', 'localtime')";
const HOUR_EXPR: &str = "CAST(strftime('%H', start_time / 1000, 'unixepoch', 'localtime') AS INTEGER)";

pub struct AggregationEngine<'a> {
    db: &'a Database,
    slow_threshold: Duration,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(db: &'a Database, slow_threshold: Duration) -> Self {
        Self { db, slow_threshold }
    }

    pub fn get_aggregated_stats(&self, range: TimeRange) -> StoreResult<StatsAggregation> {
        self.get_aggregated_stats_since(range.lower_bound())
    }

    /// Aggregate everything with `start_time >= since` (epoch ms).
    pub fn get_aggregated_stats_since(&self, since: i64) -> StoreResult<StatsAggregation> {
        let started = Instant::now();

        let mut stats = self.db.with_conn(|conn| {
            let (total_queries, total_duration) = totals(conn, since)?;

            Ok(StatsAggregation {
                since,
                total_queries,
                total_duration,
                avg_duration: average(total_duration as f64, total_queries),
                by_agent: by_agent(conn, since)?,
                by_source: by_source(conn, since)?,
                by_location: by_location(conn, since)?,
                by_day: by_day(conn, since)?,
                by_agent_by_day: grouped_by_day(conn, since, "agent_type")?,
                by_hour: by_hour(conn, since)?,
                sessions: session_lifecycle(conn, since)?,
                by_session_by_day: grouped_by_day(conn, since, "session_id")?,
                tokens: token_metrics(conn, since)?,
                query_time_ms: 0,
            })
        })?;

        let elapsed = started.elapsed();
        stats.query_time_ms = elapsed.as_millis() as u64;

        if elapsed > self.slow_threshold {
            warn!(
                elapsed_ms = stats.query_time_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                total_queries = stats.total_queries,
                "Slow stats aggregation"
            );
        } else {
            debug!(
                elapsed_ms = stats.query_time_ms,
                total_queries = stats.total_queries,
                "Aggregated stats"
            );
        }

        Ok(stats)
    }
}

fn average(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

fn non_negative(v: i64) -> u64 {
    v.max(0) as u64
}

fn totals(conn: &Connection, since: i64) -> StoreResult<(u64, u64)> {
    let mut stmt = conn.prepare_cached(
        "SELECT COUNT(*), COALESCE(SUM(duration), 0)
         FROM query_events WHERE start_time >= ?1",
    )?;
    let (count, duration): (i64, i64) = stmt.query_row([since], |r| Ok((r.get(0)?, r.get(1)?)))?;
    Ok((non_negative(count), non_negative(duration)))
}

fn by_agent(conn: &Connection, since: i64) -> StoreResult<BTreeMap<String, AgentStats>> {
    let mut stmt = conn.prepare_cached(
        "SELECT agent_type,
                COUNT(*),
                COALESCE(SUM(duration), 0),
                COALESCE(SUM(output_tokens), 0),
                AVG(CASE WHEN output_tokens IS NOT NULL THEN tokens_per_second END)
         FROM query_events
         WHERE start_time >= ?1
         GROUP BY agent_type",
    )?;
    let rows = stmt.query_map([since], |r| {
        Ok((
            r.get::<_, String>(0)?,
            AgentStats {
                count: non_negative(r.get(1)?),
                duration: non_negative(r.get(2)?),
                total_output_tokens: non_negative(r.get(3)?),
                avg_tokens_per_second: r.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
            },
        ))
    })?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (agent, stats) = row?;
        out.insert(agent, stats);
    }
    Ok(out)
}

fn by_source(conn: &Connection, since: i64) -> StoreResult<SourceBreakdown> {
    let mut stmt = conn.prepare_cached(
        "SELECT source, COUNT(*) FROM query_events WHERE start_time >= ?1 GROUP BY source",
    )?;
    let rows = stmt.query_map([since], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    let mut out = SourceBreakdown::default();
    for row in rows {
        let (source, count) = row?;
        match source.as_str() {
            "user" => out.user = non_negative(count),
            "auto" => out.auto = non_negative(count),
            _ => {}
        }
    }
    Ok(out)
}

fn by_location(conn: &Connection, since: i64) -> StoreResult<LocationBreakdown> {
    let mut stmt = conn.prepare_cached(
        "SELECT is_remote, COUNT(*) FROM query_events WHERE start_time >= ?1 GROUP BY is_remote",
    )?;
    let rows = stmt.query_map([since], |r| Ok((r.get::<_, bool>(0)?, r.get::<_, i64>(1)?)))?;
    let mut out = LocationBreakdown::default();
    for row in rows {
        let (remote, count) = row?;
        if remote {
            out.remote += non_negative(count);
        } else {
            out.local += non_negative(count);
        }
    }
    Ok(out)
}

fn by_day(conn: &Connection, since: i64) -> StoreResult<Vec<DayStats>> {
    let sql = format!(
        "SELECT {DAY_EXPR} AS day, COUNT(*), COALESCE(SUM(duration), 0)
         FROM query_events WHERE start_time >= ?1
         GROUP BY day ORDER BY day ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([since], |r| {
        Ok(DayStats {
            date: r.get(0)?,
            count: non_negative(r.get(1)?),
            duration: non_negative(r.get(2)?),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Per-day series for each distinct value of `key` (agent or session).
fn grouped_by_day(
    conn: &Connection,
    since: i64,
    key: &'static str,
) -> StoreResult<BTreeMap<String, Vec<DayStats>>> {
    let sql = format!(
        "SELECT {key}, {DAY_EXPR} AS day, COUNT(*), COALESCE(SUM(duration), 0)
         FROM query_events WHERE start_time >= ?1
         GROUP BY {key}, day ORDER BY {key} ASC, day ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([since], |r| {
        Ok((
            r.get::<_, String>(0)?,
            DayStats {
                date: r.get(1)?,
                count: non_negative(r.get(2)?),
                duration: non_negative(r.get(3)?),
            },
        ))
    })?;

    let mut out: BTreeMap<String, Vec<DayStats>> = BTreeMap::new();
    for row in rows {
        let (group, day) = row?;
        out.entry(group).or_default().push(day);
    }
    Ok(out)
}

fn by_hour(conn: &Connection, since: i64) -> StoreResult<Vec<HourStats>> {
    let sql = format!(
        "SELECT {HOUR_EXPR} AS hour, COUNT(*), COALESCE(SUM(duration), 0)
         FROM query_events WHERE start_time >= ?1
         GROUP BY hour ORDER BY hour ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([since], |r| {
        Ok(HourStats {
            hour: r.get::<_, i64>(0)?.clamp(0, 23) as u8,
            count: non_negative(r.get(1)?),
            duration: non_negative(r.get(2)?),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn session_lifecycle(conn: &Connection, since: i64) -> StoreResult<SessionLifecycle> {
    let mut lifecycle = SessionLifecycle::default();

    let (total, avg_span): (i64, Option<f64>) = conn
        .prepare_cached(
            "SELECT COUNT(*), AVG(span) FROM (
                 SELECT MAX(start_time + duration) - MIN(start_time) AS span
                 FROM query_events WHERE start_time >= ?1
                 GROUP BY session_id
             )",
        )?
        .query_row([since], |r| Ok((r.get(0)?, r.get(1)?)))?;
    lifecycle.total_sessions = non_negative(total);
    lifecycle.avg_session_duration = avg_span.unwrap_or(0.0);

    let mut stmt = conn.prepare_cached(
        "SELECT agent_type, COUNT(DISTINCT session_id)
         FROM query_events WHERE start_time >= ?1
         GROUP BY agent_type",
    )?;
    let rows = stmt.query_map([since], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    for row in rows {
        let (agent, count) = row?;
        lifecycle.sessions_by_agent.insert(agent, non_negative(count));
    }

    let sql = format!(
        "SELECT {DAY_EXPR} AS day, COUNT(DISTINCT session_id)
         FROM query_events WHERE start_time >= ?1
         GROUP BY day ORDER BY day ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([since], |r| {
        Ok(DayCount {
            date: r.get(0)?,
            count: non_negative(r.get(1)?),
        })
    })?;
    lifecycle.sessions_by_day = rows.collect::<Result<Vec<_>, _>>()?;

    Ok(lifecycle)
}

fn token_metrics(conn: &Connection, since: i64) -> StoreResult<TokenMetrics> {
    let mut stmt = conn.prepare_cached(
        "SELECT COALESCE(SUM(input_tokens), 0),
                COALESCE(SUM(output_tokens), 0),
                COALESCE(SUM(cache_read_tokens), 0),
                COALESCE(SUM(cache_write_tokens), 0),
                COUNT(output_tokens),
                AVG(CASE WHEN output_tokens IS NOT NULL THEN tokens_per_second END),
                AVG(output_tokens)
         FROM query_events WHERE start_time >= ?1",
    )?;
    let metrics = stmt.query_row([since], |r| {
        Ok(TokenMetrics {
            total_input_tokens: non_negative(r.get(0)?),
            total_output_tokens: non_negative(r.get(1)?),
            total_cache_read_tokens: non_negative(r.get(2)?),
            total_cache_write_tokens: non_negative(r.get(3)?),
            queries_with_token_data: non_negative(r.get(4)?),
            avg_tokens_per_second: r.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
            avg_output_tokens_per_query: r.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
        })
    })?;
    Ok(metrics)
}
