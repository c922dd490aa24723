mod common;

use chrono::{Duration as ChronoDuration, Local};
use common::{fact, insert_all, local_noon_ms, migrated_db};
use std::time::Duration;
use tempfile::TempDir;
use usage_ledger::{AggregationEngine, QuerySource, TimeRange, UsageFact};

fn seeded() -> (TempDir, usage_ledger::Database) {
    let dir = TempDir::new().unwrap();
    let db = migrated_db(&dir).unwrap();

    let today = Local::now().date_naive();
    let yesterday = today - ChronoDuration::days(1);
    let noon_today = local_noon_ms(today);
    let noon_yesterday = local_noon_ms(yesterday);

    let mut with_tokens = fact("s1", "general", noon_yesterday, 2_000);
    with_tokens.output_tokens = Some(400);
    with_tokens.input_tokens = Some(1_000);
    with_tokens.tokens_per_second = Some(200.0);

    let mut with_tokens_2 = fact("s1", "general", noon_yesterday + 60_000, 1_000);
    with_tokens_2.output_tokens = Some(100);
    with_tokens_2.tokens_per_second = Some(100.0);

    // Throughput without output tokens must not feed the averages.
    let mut legacy = fact("s2", "explore", noon_today, 4_000);
    legacy.tokens_per_second = Some(9_999.0);

    let mut auto_remote = fact("s3", "general", noon_today + 1_000, 3_000);
    auto_remote.source = QuerySource::Auto;
    auto_remote.is_remote = true;

    let facts: Vec<UsageFact> = vec![with_tokens, with_tokens_2, legacy, auto_remote];
    insert_all(&db, &facts).unwrap();
    (dir, db)
}

#[test]
fn test_breakdowns_add_up_to_totals() {
    let (_dir, db) = seeded();
    let engine = AggregationEngine::new(&db, Duration::from_secs(5));
    let stats = engine.get_aggregated_stats(TimeRange::Week).unwrap();

    assert_eq!(stats.total_queries, 4);
    assert_eq!(stats.total_duration, 10_000);
    assert_eq!(stats.avg_duration, 2_500.0);

    let agent_total: u64 = stats.by_agent.values().map(|a| a.count).sum();
    assert_eq!(agent_total, stats.total_queries);
    assert_eq!(stats.by_source.user + stats.by_source.auto, stats.total_queries);
    assert_eq!(stats.by_location.local + stats.by_location.remote, stats.total_queries);
    assert_eq!(stats.by_location.remote, 1);

    let day_total: u64 = stats.by_day.iter().map(|d| d.count).sum();
    assert_eq!(day_total, stats.total_queries);
    let hour_total: u64 = stats.by_hour.iter().map(|h| h.count).sum();
    assert_eq!(hour_total, stats.total_queries);
    let day_duration: u64 = stats.by_day.iter().map(|d| d.duration).sum();
    assert_eq!(day_duration, stats.total_duration);
}

#[test]
fn test_days_and_hours_follow_local_time() {
    let (_dir, db) = seeded();
    let engine = AggregationEngine::new(&db, Duration::from_secs(5));
    let stats = engine.get_aggregated_stats(TimeRange::Week).unwrap();

    let today = Local::now().date_naive();
    let yesterday = today - ChronoDuration::days(1);
    let dates: Vec<&str> = stats.by_day.iter().map(|d| d.date.as_str()).collect();
    assert_eq!(
        dates,
        vec![yesterday.to_string().as_str(), today.to_string().as_str()]
    );
    assert!(stats.by_hour.iter().all(|h| h.hour == 12));

    assert_eq!(stats.by_agent_by_day["general"].len(), 2);
    assert_eq!(stats.by_agent_by_day["explore"].len(), 1);
    assert_eq!(stats.by_session_by_day["s1"][0].count, 2);
}

#[test]
fn test_token_averages_only_cover_rows_with_token_data() {
    let (_dir, db) = seeded();
    let engine = AggregationEngine::new(&db, Duration::from_secs(5));
    let stats = engine.get_aggregated_stats(TimeRange::Week).unwrap();

    assert_eq!(stats.tokens.queries_with_token_data, 2);
    assert_eq!(stats.tokens.total_output_tokens, 500);
    assert_eq!(stats.tokens.total_input_tokens, 1_000);
    assert_eq!(stats.tokens.avg_tokens_per_second, 150.0);
    assert_eq!(stats.tokens.avg_output_tokens_per_query, 250.0);

    assert_eq!(stats.by_agent["general"].avg_tokens_per_second, 150.0);
    assert_eq!(stats.by_agent["general"].total_output_tokens, 500);
    assert_eq!(stats.by_agent["explore"].avg_tokens_per_second, 0.0);
}

#[test]
fn test_session_lifecycle() {
    let (_dir, db) = seeded();
    let engine = AggregationEngine::new(&db, Duration::from_secs(5));
    let stats = engine.get_aggregated_stats(TimeRange::Week).unwrap();

    assert_eq!(stats.sessions.total_sessions, 3);
    assert_eq!(stats.sessions.sessions_by_agent["general"], 2);
    assert_eq!(stats.sessions.sessions_by_agent["explore"], 1);
    let per_day: u64 = stats.sessions.sessions_by_day.iter().map(|d| d.count).sum();
    assert_eq!(per_day, 3);
    // s1 spans 61s, s2 4s, s3 3s.
    assert_eq!(stats.sessions.avg_session_duration, (61_000.0 + 4_000.0 + 3_000.0) / 3.0);
}

#[test]
fn test_range_bound_is_shared_by_every_breakdown() {
    let (_dir, db) = seeded();
    let engine = AggregationEngine::new(&db, Duration::from_secs(5));
    let since = local_noon_ms(Local::now().date_naive()) - 1;
    let stats = engine.get_aggregated_stats_since(since).unwrap();

    assert_eq!(stats.since, since);
    assert_eq!(stats.total_queries, 2);
    assert_eq!(stats.by_day.len(), 1);
    assert_eq!(stats.sessions.total_sessions, 2);
    assert_eq!(stats.tokens.queries_with_token_data, 0);
}

#[test]
fn test_wider_bound_never_counts_fewer_queries() {
    let (_dir, db) = seeded();
    let engine = AggregationEngine::new(&db, Duration::from_secs(5));
    let today = Local::now().date_naive();

    let bounds = [
        local_noon_ms(today) + 2_000,
        local_noon_ms(today) - 1,
        local_noon_ms(today - ChronoDuration::days(1)) + 30_000,
        local_noon_ms(today - ChronoDuration::days(1)) - 1,
        0,
    ];
    let totals: Vec<u64> = bounds
        .iter()
        .map(|&since| engine.get_aggregated_stats_since(since).unwrap().total_queries)
        .collect();

    assert!(totals.windows(2).all(|w| w[0] <= w[1]), "{totals:?}");
    assert_eq!(totals, vec![0, 2, 3, 4, 4]);
}
