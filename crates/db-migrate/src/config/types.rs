//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MySQL).
    pub source: SourceConfig,

    /// Production target configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Disposable verification database, deployed to before the real target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<TargetConfig>,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mysql" for now).
    #[serde(default = "default_mysql")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Require TLS on the source connection (default: false).
    #[serde(default)]
    pub ssl: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres" for now).
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
/// Concurrency fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per source read and per bulk insert.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Time bound for a single DDL statement or metadata query.
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,

    /// Time bound for reading or writing one batch of rows.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Marker that opens and closes procedural bodies in generated DDL.
    #[serde(default = "default_block_marker")]
    pub block_marker: String,

    /// Apply independent objects of one tier concurrently.
    #[serde(default)]
    pub parallel_tiers: bool,

    /// Objects applied at once within a tier. Auto-tuned when `parallel_tiers` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_concurrency: Option<usize>,

    /// Maximum PostgreSQL connections per target. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_target_connections: Option<usize>,

    /// Maximum MySQL connections. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_connections: Option<usize>,

    /// Load cyclic foreign-key groups with constraints deferred (default: true).
    /// When false a cycle aborts planning.
    #[serde(default = "default_true")]
    pub defer_cyclic_constraints: bool,

    /// Drop every object in the verification database before deploying (default: true).
    #[serde(default = "default_true")]
    pub reset_verification_target: bool,

    /// Continue to production when verification ends `partial` (default: false).
    #[serde(default)]
    pub promote_partial: bool,

    /// Reset sequences to max(pk) + 1 after loading (default: true).
    #[serde(default = "default_true")]
    pub reset_sequences: bool,

    /// Count rows whose foreign key points at no parent row during validation
    /// (default: true). Bulk loads bypass constraint triggers.
    #[serde(default = "default_true")]
    pub check_foreign_keys: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            statement_timeout_secs: default_statement_timeout(),
            batch_timeout_secs: default_batch_timeout(),
            block_marker: default_block_marker(),
            parallel_tiers: false,
            tier_concurrency: None,
            max_target_connections: None,
            max_source_connections: None,
            defer_cyclic_constraints: true,
            reset_verification_target: true,
            promote_partial: false,
            reset_sequences: true,
            check_foreign_keys: true,
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;

        // Half the cores, 1-8, only when the user opted into parallel tiers
        if self.tier_concurrency.is_none() {
            let concurrency = if self.parallel_tiers {
                (cores / 2).clamp(1, 8)
            } else {
                1
            };
            self.tier_concurrency = Some(concurrency);
        }
        let concurrency = self.get_tier_concurrency();

        // Executor workers plus the pinned load session and a spare for validation
        if self.max_target_connections.is_none() {
            self.max_target_connections = Some((concurrency + 2).clamp(4, 32));
        }

        if self.max_source_connections.is_none() {
            self.max_source_connections = Some(4);
        }

        info!(
            "Auto-tuned config: tier_concurrency={}, target_conns={}, source_conns={}, batch_size={}",
            self.get_tier_concurrency(),
            self.get_max_target_connections(),
            self.get_max_source_connections(),
            self.batch_size,
        );

        self
    }

    // Effective values with fallback defaults, used when the config hasn't been auto-tuned

    pub fn get_tier_concurrency(&self) -> usize {
        self.tier_concurrency.unwrap_or(1).max(1)
    }

    pub fn get_max_target_connections(&self) -> usize {
        self.max_target_connections.unwrap_or(4)
    }

    pub fn get_max_source_connections(&self) -> usize {
        self.max_source_connections.unwrap_or(4)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

// Default value functions for serde
fn default_mysql() -> String {
    "mysql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_statement_timeout() -> u64 {
    300
}

fn default_batch_timeout() -> u64 {
    600
}

fn default_block_marker() -> String {
    "$$".to_string()
}

fn default_true() -> bool {
    true
}
