//! Usage Ledger Library
//!
//! An embedded analytics store for AI-assistant query events, with versioned
//! schema migrations, dashboard rollups and a cross-source cost audit.
//!
//! ## Architecture Overview
//!
//! - [`db`] - SQLite handle shared by every component
//! - [`migrations`] - Ordered, transactional, recorded schema upgrades
//! - [`event_store`] - Insert and filtered reads of usage facts
//! - [`aggregation`] - Dashboard statistics over a time range
//! - [`audit`] - Reconciliation of local usage against the external usage CLI
//! - [`pricing`] - Per-model API rates behind a lookup trait
//! - [`config`] - Configuration with file and environment overrides
//! - [`logging`] - Structured logging with pretty, JSON and file output
//! - [`display`] - Terminal and JSON output for the CLI
//!
//! ## Example
//!
//! ```no_run
//! use usage_ledger::{Database, EventStore, QuerySource, SchemaMigrator, UsageFact};
//!
//! # fn example() -> anyhow::Result<()> {
//! let db = Database::open("usage.db")?;
//! SchemaMigrator::new().run_migrations(&db)?;
//!
//! let mut fact = UsageFact::new("session-1", "general", QuerySource::User, 1_760_000_000_000, 1200);
//! fact.output_tokens = Some(350);
//! EventStore::new(&db).insert(&fact)?;
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod audit;
pub mod config;
pub mod db;
pub mod display;
pub mod error;
pub mod event_store;
pub mod logging;
pub mod migrations;
pub mod models;
pub mod pricing;

pub use aggregation::AggregationEngine;
pub use audit::{AuditRequest, AuditResult, AuditService, ExternalUsageClient};
pub use db::Database;
pub use error::{AuditError, ExternalError, MigrationError, StoreError};
pub use event_store::EventStore;
pub use migrations::SchemaMigrator;
pub use models::*;
pub use pricing::{PricingLookup, StaticPricing};
