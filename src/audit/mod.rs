//! Usage audit: reconcile locally recorded usage against the authoritative
//! report produced by the external usage CLI.
//!
//! ## Pipeline
//!
//! 1. Acquire the authoritative daily report ([`external`]). When this
//!    machine has no usage history, every enabled remote host is asked
//!    concurrently and the non-empty answers are merged.
//! 2. Group local facts for the same period ([`local`]).
//! 3. Reconcile the two ([`reconcile`]), a pure step.
//! 4. Optionally persist the result as a snapshot ([`snapshot`]).

pub mod external;
pub mod local;
pub mod normalize;
pub mod reconcile;
pub mod remote;
pub mod snapshot;
pub mod types;

pub use external::{ExternalUsageClient, UsageFetcher};
pub use local::{query_local, resolve_cost, CostSource, ResolvedCost};
pub use reconcile::{classify, reconcile, ReconcileInput};
pub use remote::{RemoteHost, RemoteOutput, RemoteShell, SshShell};
pub use snapshot::SnapshotStore;
pub use types::*;

use crate::db::Database;
use crate::error::AuditError;
use crate::pricing::PricingLookup;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRequest {
    pub audit_type: AuditType,
    pub period: AuditPeriod,
    /// Ask this remote host directly instead of the local tool.
    pub host: Option<String>,
}

impl AuditRequest {
    pub fn new(audit_type: AuditType, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            audit_type,
            period: AuditPeriod::new(start, end),
            host: None,
        }
    }

    /// Default period for a scheduled audit, relative to `today`:
    /// daily is yesterday, weekly the seven days ending yesterday, monthly
    /// the previous calendar month, manual just today.
    pub fn for_type(audit_type: AuditType, today: NaiveDate) -> Self {
        let yesterday = today.pred_opt().unwrap_or(today);
        let (start, end) = match audit_type {
            AuditType::Daily => (yesterday, yesterday),
            AuditType::Weekly => (yesterday - ChronoDuration::days(6), yesterday),
            AuditType::Monthly => {
                let this_month = today.with_day(1).unwrap_or(today);
                let last_day = this_month.pred_opt().unwrap_or(this_month);
                (last_day.with_day(1).unwrap_or(last_day), last_day)
            }
            AuditType::Manual => (today, today),
        };
        Self::new(audit_type, start, end)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

pub struct AuditService<'a> {
    db: &'a Database,
    fetcher: Arc<dyn UsageFetcher>,
    pricing: Arc<dyn PricingLookup>,
    remotes: Vec<RemoteHost>,
}

impl<'a> AuditService<'a> {
    pub fn new(
        db: &'a Database,
        fetcher: Arc<dyn UsageFetcher>,
        pricing: Arc<dyn PricingLookup>,
    ) -> Self {
        Self {
            db,
            fetcher,
            pricing,
            remotes: Vec::new(),
        }
    }

    pub fn with_remotes(mut self, remotes: Vec<RemoteHost>) -> Self {
        self.remotes = remotes;
        self
    }

    /// Reconcile without persisting anything.
    pub async fn compute(&self, request: &AuditRequest) -> Result<AuditResult, AuditError> {
        let period = request.period;
        if period.start > period.end {
            return Err(AuditError::InvalidPeriod {
                start: period.start,
                end: period.end,
            });
        }

        let (external, source) = self.acquire(request).await?;
        let local = query_local(self.db, &period)?;

        let result = reconcile(ReconcileInput {
            audit_type: request.audit_type,
            period,
            generated_at: Utc::now(),
            source,
            local: &local,
            external: &external,
            pricing: self.pricing.as_ref(),
        });

        info!(
            audit_type = %request.audit_type,
            start = %period.start,
            end = %period.end,
            entries = result.summary.total,
            matched = result.summary.matched,
            minor = result.summary.minor,
            major = result.summary.major,
            missing = result.summary.missing,
            anomalies = result.anomalies.len(),
            "Audit computed"
        );
        Ok(result)
    }

    /// Reconcile and save a snapshot; returns the snapshot id with the result.
    pub async fn run(&self, request: &AuditRequest) -> Result<(i64, AuditResult), AuditError> {
        let result = self.compute(request).await?;
        let id = SnapshotStore::new(self.db).save_snapshot(&result)?;
        Ok((id, result))
    }

    async fn acquire(
        &self,
        request: &AuditRequest,
    ) -> Result<(ExternalReport, AuthoritativeSource), AuditError> {
        let since = Some(request.period.start);
        let until = Some(request.period.end);

        if let Some(name) = &request.host {
            let host = self
                .remotes
                .iter()
                .find(|h| &h.name == name || &h.host == name)
                .ok_or_else(|| AuditError::UnknownHost(name.clone()))?;
            let report = self
                .fetcher
                .fetch_remote(host, ReportPeriod::Daily, since, until)
                .await?;
            return Ok((
                report,
                AuthoritativeSource::Remote {
                    hosts: vec![host.name.clone()],
                },
            ));
        }

        match self
            .fetcher
            .fetch_local(ReportPeriod::Daily, since, until)
            .await
        {
            Ok(report) => Ok((report, AuthoritativeSource::Local)),
            Err(crate::error::ExternalError::NoUsageHistory) => {
                info!("No local usage history; falling back to remote hosts");
                self.fetch_from_remotes(since, until).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ask every enabled remote concurrently and merge the non-empty reports.
    async fn fetch_from_remotes(
        &self,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<(ExternalReport, AuthoritativeSource), AuditError> {
        let enabled: Vec<&RemoteHost> = self.remotes.iter().filter(|h| h.enabled).collect();
        if enabled.is_empty() {
            return Err(AuditError::NoRemotesConfigured);
        }

        let fetches = enabled.iter().map(|host| async move {
            let outcome = self
                .fetcher
                .fetch_remote(host, ReportPeriod::Daily, since, until)
                .await;
            (*host, outcome)
        });
        let outcomes = join_all(fetches).await;

        let mut reports = Vec::new();
        let mut hosts = Vec::new();
        for (host, outcome) in outcomes {
            match outcome {
                Ok(report) if !report.is_empty() => {
                    hosts.push(host.name.clone());
                    reports.push(report);
                }
                Ok(_) => info!(host = %host.name, "Remote host returned no usage"),
                Err(e) => warn!(host = %host.name, error = %e, "Remote usage fetch failed"),
            }
        }

        if reports.is_empty() {
            return Err(AuditError::RemotesEmpty {
                attempted: enabled.len(),
            });
        }

        Ok((
            ExternalReport::merge(ReportPeriod::Daily, reports),
            AuthoritativeSource::Remote { hosts },
        ))
    }
}
