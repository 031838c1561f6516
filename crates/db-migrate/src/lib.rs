//! # db-migrate
//!
//! Deterministic schema and data migration engine, MySQL to PostgreSQL.
//!
//! The library decides in what order transformed schema objects and table
//! data move, applies them to a live target one statement at a time, and
//! reconciles the result:
//!
//! - **Dependency ordering** of tables from foreign keys, with cyclic groups
//!   deferred instead of rejected
//! - **Phased deployment** by kind tier with one-shot auto-remediation of
//!   known error signatures
//! - **Streaming data load** in bounded batches with integrity checks
//!   suspended around the whole load
//! - **Validation** of object existence and row counts
//! - **Two-target lifecycle**: a disposable verification database first,
//!   then production, through the same code path
//!
//! ## Example
//!
//! ```rust,no_run
//! use db_migrate::{Config, Orchestrator, SchemaDescription, SchemaObject};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> db_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let schema = SchemaDescription::load("schema.json")?;
//!     let objects = SchemaObject::load_all("objects.json")?;
//!     let mut orchestrator = Orchestrator::new(config, schema, objects);
//!     let report = orchestrator.run(&CancellationToken::new(), false).await?;
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod deploy;
pub mod error;
pub mod load;
pub mod orchestrator;
pub mod plan;
pub mod schema;
pub mod sql;
pub mod state;
pub mod validate;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use db::{
    Batch, ConnectionDescriptor, ReadCursor, Row, SourceDatabase, SqlValue, TargetDatabase,
    TargetRole,
};
pub use deploy::{DeploySummary, ExecutorOptions, PhasedDeploymentExecutor, Remediation, RemediationTable};
pub use error::{MigrateError, Result};
pub use load::{LoadSummary, LoaderOptions, StreamingDataMigrator};
pub use orchestrator::{HealthCheckResult, Orchestrator, PassReport, RunReport};
pub use plan::{DependencyGraphBuilder, DeploymentPlan, GraphOrder};
pub use schema::{Column, ForeignKeyRef, ObjectKind, SchemaDescription, SchemaObject, TableMeta};
pub use sql::StatementSplitter;
pub use state::{ExecutionRecord, MigrationState, Outcome, Phase, RunStatus};
pub use validate::{ValidationEngine, ValidationRecord, ValidationReport, ValidationStatus};
