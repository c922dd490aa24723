use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use usage_ledger::audit::{AuditRequest, AuditService, AuditType, ExternalUsageClient, SnapshotStore};
use usage_ledger::config::Config;
use usage_ledger::display::DisplayManager;
use usage_ledger::logging::init_logging;
use usage_ledger::{
    AggregationEngine, Database, EventStore, QueryFilters, QuerySource, SchemaMigrator,
    StaticPricing, TimeRange,
};

#[derive(Parser)]
#[command(name = "usage-ledger")]
#[command(about = "Usage analytics store with schema migrations, dashboard stats and cost auditing")]
#[command(version)]
struct Cli {
    /// Database file (overrides config and USAGE_LEDGER_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Config file to load instead of the default search path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate {
        /// Only show the current version and migration history
        #[arg(long)]
        status: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show aggregated usage statistics
    Stats {
        /// day, week, month, quarter, year or all
        #[arg(long, default_value = "week")]
        range: TimeRange,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// List recorded usage events, most recent first
    Events {
        /// day, week, month, quarter, year or all
        #[arg(long, default_value = "week")]
        range: TimeRange,
        #[arg(long)]
        agent: Option<String>,
        /// user or auto
        #[arg(long)]
        source: Option<QuerySource>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        session: Option<String>,
        /// Show at most N events
        #[arg(long)]
        limit: Option<usize>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Reconcile local usage against the external usage tool
    Audit {
        /// daily, weekly, monthly or manual
        #[arg(long = "type")]
        audit_type: Option<AuditType>,
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<NaiveDate>,
        /// End date (YYYY-MM-DD)
        #[arg(long)]
        until: Option<NaiveDate>,
        /// Fetch authoritative usage from this configured remote host
        #[arg(long)]
        host: Option<String>,
        /// Compute without saving a snapshot
        #[arg(long)]
        dry_run: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show past audit snapshots
    History {
        /// Show last N snapshots
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only snapshots whose period overlaps [from, to] (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Commands::Migrate { json, .. }
            | Commands::Stats { json, .. }
            | Commands::Events { json, .. }
            | Commands::Audit { json, .. }
            | Commands::History { json, .. } => *json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json = cli.command.json();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => handle_error(e, json),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from_file(path)?;
            config.apply_env_overrides()?;
            config.validate()?;
            config
        }
        None => Config::load()?,
    };
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    let _guard = init_logging(&config.logging);
    let display = DisplayManager::new();

    let db = Database::open(&config.database.path).with_context(|| {
        format!("Failed to open database {}", config.database.path.display())
    })?;
    let migrator = SchemaMigrator::new();

    if let Commands::Migrate { status, json } = cli.command {
        if !status {
            let report = migrator.run_migrations(&db)?;
            debug!(from = report.from_version, to = report.to_version, "Migrations finished");
        }
        let current = migrator.current_version(&db)?;
        let history = migrator.history(&db)?;
        display.display_migrations(current, migrator.target_version(), &history, json);
        return Ok(());
    }

    migrator
        .run_migrations(&db)
        .context("Failed to bring the schema up to date")?;

    match cli.command {
        Commands::Migrate { .. } => {}
        Commands::Stats { range, json } => {
            let engine = AggregationEngine::new(
                &db,
                Duration::from_millis(config.aggregation.slow_query_ms),
            );
            let stats = engine.get_aggregated_stats(range)?;
            display.display_stats(&stats, json);
        }
        Commands::Events {
            range,
            agent,
            source,
            project,
            session,
            limit,
            json,
        } => {
            let filters = QueryFilters {
                agent_type: agent,
                source,
                project_path: project,
                session_id: session,
            };
            let mut events = EventStore::new(&db).query(range, &filters)?;
            if let Some(limit) = limit {
                events.truncate(limit);
            }
            display.display_events(&events, json);
        }
        Commands::Audit {
            audit_type,
            since,
            until,
            host,
            dry_run,
            json,
        } => {
            let today = Local::now().date_naive();
            let mut request = match (since, until) {
                (None, None) => AuditRequest::for_type(audit_type.unwrap_or(AuditType::Daily), today),
                (since, until) => {
                    let end = until.unwrap_or(today);
                    AuditRequest::new(
                        audit_type.unwrap_or(AuditType::Manual),
                        since.unwrap_or(end),
                        end,
                    )
                }
            };
            if let Some(host) = host {
                request = request.with_host(host);
            }

            let service = AuditService::new(
                &db,
                Arc::new(ExternalUsageClient::from_config(&config.audit)),
                Arc::new(StaticPricing::claude_defaults()),
            )
            .with_remotes(config.remotes.clone());

            if dry_run {
                let result = service.compute(&request).await?;
                display.display_audit(&result, None, json);
            } else {
                let (id, result) = service.run(&request).await?;
                display.display_audit(&result, Some(id), json);
            }
        }
        Commands::History {
            limit,
            from,
            to,
            json,
        } => {
            let store = SnapshotStore::new(&db);
            let snapshots = match (from, to) {
                (None, None) => store.get_history(limit)?,
                (from, to) => {
                    let mut found = store.get_snapshots_by_range(
                        from.unwrap_or_else(earliest_date),
                        to.unwrap_or_else(latest_date),
                    )?;
                    found.truncate(limit);
                    found
                }
            };
            display.display_history(&snapshots, json);
        }
    }

    Ok(())
}

// Four-digit years keep the text comparison in the snapshot table valid.
fn earliest_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn latest_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}

fn handle_error(e: anyhow::Error, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
    } else {
        eprintln!("Error: {e:#}");
    }
    process::exit(1);
}
