//! Database seams used by the migration engine.
//!
//! - [`SourceDatabase`]: read-only row streaming from the source
//! - [`TargetDatabase`]: statement execution, bulk load and inspection of a target
//!
//! The deployment executor, data migrator and validation engine only see these
//! traits, so the verification database and the production target go through
//! the same code.

mod mysql;
mod postgres;
mod tls;
mod value;

pub use mysql::MysqlSource;
pub use postgres::PgTarget;
pub use tls::{SslMode, TlsBuilder};
pub use value::{Row, SqlValue};

use crate::error::{MigrateError, Result};
use crate::schema::{ForeignKeyRef, ObjectKind, TableMeta};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Which target a connection points at. Only used to label records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    /// Disposable database that absorbs structural errors first.
    Verification,
    /// The real target.
    Production,
}

impl fmt::Display for TargetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRole::Verification => f.write_str("verification"),
            TargetRole::Production => f.write_str("production"),
        }
    }
}

/// Position of a paginated table read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadCursor {
    /// Nothing read yet.
    Start,
    /// Keyset pagination: rows with an integer key above this value.
    AfterKey(i64),
    /// OFFSET pagination for tables without a single integer key.
    Offset(u64),
}

/// One page of source rows.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Rows in `TableMeta::columns` order.
    pub rows: Vec<Row>,
    /// Cursor for the next page, `None` once the table is exhausted.
    pub next: Option<ReadCursor>,
}

/// Connection details safe to log and persist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub engine: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}/{}", self.engine, self.host, self.port, self.database)
    }
}

/// Read-only access to the source database.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Exact row count.
    async fn row_count(&self, table: &TableMeta) -> Result<i64>;

    /// Read up to `limit` rows starting at `cursor`, in a stable order.
    async fn fetch_batch(&self, table: &TableMeta, cursor: &ReadCursor, limit: usize) -> Result<Batch>;

    fn descriptor(&self) -> ConnectionDescriptor;
}

/// A target database the plan is deployed to.
#[async_trait]
pub trait TargetDatabase: Send + Sync {
    fn role(&self) -> TargetRole;

    fn descriptor(&self) -> ConnectionDescriptor;

    /// Run one statement in its own implicit transaction.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Whether an object of `kind` named `name` exists.
    async fn object_exists(&self, name: &str, kind: ObjectKind) -> Result<bool>;

    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Rows of `table` whose non-null `foreign_key` columns match no row of
    /// the referenced table.
    async fn orphan_rows(&self, table: &str, foreign_key: &ForeignKeyRef) -> Result<i64>;

    /// Remove every row ahead of a reload.
    async fn clear_table(&self, table: &str) -> Result<()>;

    /// Write one batch as a single bulk insert. Returns rows written.
    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64>;

    /// Stop enforcing foreign keys and triggers for subsequent loads.
    async fn suspend_integrity(&self) -> Result<()>;

    /// Undo `suspend_integrity`.
    async fn restore_integrity(&self) -> Result<()>;

    /// Set the sequence behind `column` to max + 1 (1 when empty).
    /// Returns the next value, or `None` when the column has no sequence.
    async fn reset_sequence(&self, table: &str, column: &str) -> Result<Option<i64>>;

    /// Drop every object in the target schema. Returns objects dropped.
    async fn reset(&self) -> Result<usize>;
}

/// Await a database call, failing with `MigrateError::Timeout` after `limit`.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MigrateError::timeout(operation, limit)),
    }
}
