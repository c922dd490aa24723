#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveDate, TimeZone};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use usage_ledger::audit::{
    ExternalDay, ExternalModelUsage, ExternalReport, RemoteHost, ReportPeriod, TokenCounts,
    UsageFetcher,
};
use usage_ledger::{
    BillingMode, Database, EventStore, ExternalError, QuerySource, SchemaMigrator, UsageFact,
};

pub fn migrated_db(dir: &TempDir) -> Result<Database> {
    let db = Database::open(dir.path().join("usage.db"))?;
    SchemaMigrator::new().run_migrations(&db)?;
    Ok(db)
}

pub fn migrated_db_at(path: &Path) -> Result<Database> {
    let db = Database::open(path)?;
    SchemaMigrator::new().run_migrations(&db)?;
    Ok(db)
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Local-time noon, so the fact lands on `date` whatever the machine's zone.
pub fn local_noon_ms(date: NaiveDate) -> i64 {
    Local
        .from_local_datetime(&date.and_hms_opt(12, 0, 0).unwrap())
        .earliest()
        .unwrap()
        .timestamp_millis()
}

pub fn fact(session: &str, agent: &str, start_time: i64, duration_ms: u64) -> UsageFact {
    UsageFact::new(session, agent, QuerySource::User, start_time, duration_ms)
}

/// A priced fact on `date` for the audit tests.
pub fn priced_fact(
    date: NaiveDate,
    model: &str,
    mode: BillingMode,
    input: u64,
    output: u64,
    cost: f64,
) -> UsageFact {
    let mut f = fact("audit-session", "general", local_noon_ms(date), 1_000);
    f.input_tokens = Some(input);
    f.output_tokens = Some(output);
    f.local_pricing_model = Some(model.to_string());
    f.local_billing_mode = Some(mode);
    f.local_cost = Some(cost);
    f
}

pub fn insert_all(db: &Database, facts: &[UsageFact]) -> Result<()> {
    let store = EventStore::new(db);
    for f in facts {
        store.insert(f)?;
    }
    Ok(())
}

pub fn external_day(
    date: NaiveDate,
    model: &str,
    input: u64,
    output: u64,
    cost: f64,
) -> ExternalDay {
    let tokens = TokenCounts::new(input, output, 0, 0);
    ExternalDay {
        date,
        tokens,
        total_tokens: tokens.total(),
        total_cost: cost,
        models: vec![ExternalModelUsage {
            model: model.to_string(),
            tokens,
            cost,
        }],
    }
}

pub fn daily_report(days: Vec<ExternalDay>) -> ExternalReport {
    ExternalReport {
        period: ReportPeriod::Daily,
        days,
    }
}

/// What a fake fetch returns.
#[derive(Clone)]
pub enum Outcome {
    Report(ExternalReport),
    NoHistory,
    Timeout,
    Unreachable,
}

impl Outcome {
    fn into_result(self, host: &str) -> Result<ExternalReport, ExternalError> {
        match self {
            Outcome::Report(report) => Ok(report),
            Outcome::NoHistory => Err(ExternalError::NoUsageHistory),
            Outcome::Timeout => Err(ExternalError::Timeout {
                after: Duration::from_secs(1),
            }),
            Outcome::Unreachable => Err(ExternalError::Transport {
                host: host.to_string(),
                message: "Connection refused".to_string(),
            }),
        }
    }
}

/// Scripted stand-in for the external usage tool.
pub struct FakeFetcher {
    pub local: Outcome,
    pub remotes: HashMap<String, Outcome>,
    pub local_calls: AtomicUsize,
    pub remote_calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn local(outcome: Outcome) -> Self {
        Self {
            local: outcome,
            remotes: HashMap::new(),
            local_calls: AtomicUsize::new(0),
            remote_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_remote(mut self, name: &str, outcome: Outcome) -> Self {
        self.remotes.insert(name.to_string(), outcome);
        self
    }
}

#[async_trait]
impl UsageFetcher for FakeFetcher {
    async fn fetch_local(
        &self,
        _period: ReportPeriod,
        _since: Option<NaiveDate>,
        _until: Option<NaiveDate>,
    ) -> Result<ExternalReport, ExternalError> {
        self.local_calls.fetch_add(1, Ordering::SeqCst);
        self.local.clone().into_result("localhost")
    }

    async fn fetch_remote(
        &self,
        host: &RemoteHost,
        period: ReportPeriod,
        _since: Option<NaiveDate>,
        _until: Option<NaiveDate>,
    ) -> Result<ExternalReport, ExternalError> {
        self.remote_calls.fetch_add(1, Ordering::SeqCst);
        self.remotes
            .get(&host.name)
            .cloned()
            .unwrap_or(Outcome::Report(ExternalReport::empty(period)))
            .into_result(&host.name)
    }
}
