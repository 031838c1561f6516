//! Streaming data load in dependency order.
//!
//! Referential integrity on the target is suspended once before the first
//! table and restored once after the last, so cyclic groups can load in any
//! order. Each table is cleared, then copied in bounded batches, one bulk
//! insert per batch.

mod transform;

pub use transform::{ColumnTransform, RowTransformer};

use crate::config::MigrationConfig;
use crate::db::{with_timeout, Batch, ReadCursor, Row, SourceDatabase, TargetDatabase};
use crate::error::{MigrateError, Result};
use crate::plan::DeploymentPlan;
use crate::schema::{SchemaDescription, TableMeta};
use crate::state::{LoadStatus, MigrationState, Phase, SequenceResetRecord, TableLoadRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Loader tuning.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Rows per read and per insert.
    pub batch_size: usize,
    /// Bound on reading or writing one batch.
    pub batch_timeout: Duration,
    /// Bound on counts, clears, integrity toggles and sequence resets.
    pub statement_timeout: Duration,
    pub reset_sequences: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_timeout: Duration::from_secs(600),
            statement_timeout: Duration::from_secs(300),
            reset_sequences: true,
        }
    }
}

impl LoaderOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout(),
            statement_timeout: config.statement_timeout(),
            reset_sequences: config.reset_sequences,
        }
    }
}

/// Totals for one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub tables_loaded: usize,
    pub tables_failed: usize,
    pub tables_skipped: usize,
    pub rows_loaded: u64,
    pub sequences_reset: usize,
}

impl LoadSummary {
    fn add(&mut self, record: &TableLoadRecord) {
        match record.status {
            LoadStatus::Loaded => self.tables_loaded += 1,
            LoadStatus::Failed => self.tables_failed += 1,
            LoadStatus::Skipped => self.tables_skipped += 1,
        }
        self.rows_loaded += record.rows_loaded;
    }
}

/// Copies rows from the source into one target.
pub struct StreamingDataMigrator {
    options: LoaderOptions,
}

impl StreamingDataMigrator {
    pub fn new(options: LoaderOptions) -> Self {
        Self { options }
    }

    /// Load every table of `plan.data_order` that has metadata in `schema`.
    ///
    /// Per-table failures are recorded and the load moves on. Only failing to
    /// suspend or restore integrity is returned as an error.
    pub async fn migrate(
        &self,
        plan: &DeploymentPlan,
        schema: &SchemaDescription,
        source: &dyn SourceDatabase,
        target: &dyn TargetDatabase,
        state: &mut MigrationState,
        cancel: &CancellationToken,
    ) -> Result<LoadSummary> {
        let role = target.role();
        let tables: Vec<&TableMeta> = plan
            .data_order
            .iter()
            .filter_map(|name| schema.table(name))
            .collect();
        info!(
            "Loading {} tables into {} target (batch size {})",
            tables.len(),
            role,
            self.options.batch_size
        );

        with_timeout(
            "suspend integrity",
            self.options.statement_timeout,
            target.suspend_integrity(),
        )
        .await
        .map_err(|e| {
            error!("Could not suspend referential integrity on {} target: {}", role, e);
            e
        })?;

        let mut summary = LoadSummary::default();
        for table in &tables {
            let record = if cancel.is_cancelled() {
                self.new_record(role, table, LoadStatus::Skipped, Some("run cancelled".into()))
            } else {
                self.load_table(table, source, target, cancel).await
            };
            summary.add(&record);
            state.append_load(record);
        }

        let restored = with_timeout(
            "restore integrity",
            self.options.statement_timeout,
            target.restore_integrity(),
        )
        .await;
        if let Err(e) = &restored {
            error!("Could not restore referential integrity on {} target: {}", role, e);
        }

        if self.options.reset_sequences && !cancel.is_cancelled() {
            for table in &tables {
                let Some(column) = table.integer_pk() else {
                    continue;
                };
                let result = with_timeout(
                    "reset sequence",
                    self.options.statement_timeout,
                    target.reset_sequence(&table.name, &column.name),
                )
                .await;
                let (next_value, error) = match result {
                    Ok(next) => {
                        if let Some(next) = next {
                            debug!("{}.{} sequence restarts at {}", table.name, column.name, next);
                            summary.sequences_reset += 1;
                        }
                        (next, None)
                    }
                    Err(e) => {
                        warn!("{}: sequence reset failed: {}", table.name, e);
                        (None, Some(e.detail()))
                    }
                };
                state.append_sequence_reset(SequenceResetRecord {
                    target: role,
                    table: table.name.clone(),
                    column: column.name.clone(),
                    next_value,
                    error,
                    timestamp: Utc::now(),
                });
            }
        }

        restored?;
        state.mark_phase(Phase::DataLoaded, Some(role));
        info!(
            "Data loaded into {}: {} tables loaded, {} failed, {} skipped, {} rows",
            role,
            summary.tables_loaded,
            summary.tables_failed,
            summary.tables_skipped,
            summary.rows_loaded
        );
        Ok(summary)
    }

    fn new_record(
        &self,
        role: crate::db::TargetRole,
        table: &TableMeta,
        status: LoadStatus,
        error: Option<String>,
    ) -> TableLoadRecord {
        TableLoadRecord {
            target: role,
            table: table.name.clone(),
            status,
            source_rows: None,
            rows_loaded: 0,
            batches: 0,
            error,
            timestamp: Utc::now(),
        }
    }

    /// Clear, then copy batch by batch until the source is exhausted.
    /// A failed read or write ends this table only.
    async fn load_table(
        &self,
        table: &TableMeta,
        source: &dyn SourceDatabase,
        target: &dyn TargetDatabase,
        cancel: &CancellationToken,
    ) -> TableLoadRecord {
        let mut record = self.new_record(target.role(), table, LoadStatus::Loaded, None);
        let fail = |mut record: TableLoadRecord, err: MigrateError| {
            warn!(
                "{}: load failed after {} rows: {}",
                record.table, record.rows_loaded, err
            );
            record.status = LoadStatus::Failed;
            record.error = Some(err.detail());
            record.timestamp = Utc::now();
            record
        };

        if table.columns.is_empty() {
            return fail(
                record,
                MigrateError::transfer(&table.name, "no column metadata"),
            );
        }

        match with_timeout("count source rows", self.options.statement_timeout, source.row_count(table)).await {
            Ok(count) => record.source_rows = Some(count),
            Err(e) => return fail(record, e),
        }

        if let Err(e) = with_timeout(
            "clear table",
            self.options.statement_timeout,
            target.clear_table(&table.name),
        )
        .await
        {
            return fail(record, e);
        }

        let transformer = RowTransformer::for_table(table);
        let columns = table.column_names();
        let mut cursor = ReadCursor::Start;

        loop {
            if cancel.is_cancelled() {
                return fail(record, MigrateError::Cancelled);
            }

            let Batch { rows, next } = match with_timeout(
                "read batch",
                self.options.batch_timeout,
                source.fetch_batch(table, &cursor, self.options.batch_size),
            )
            .await
            {
                Ok(batch) => batch,
                Err(e) => return fail(record, e),
            };

            if rows.is_empty() {
                break;
            }

            let rows: Vec<Row> = rows.into_iter().map(|row| transformer.apply(row)).collect();
            match with_timeout(
                "write batch",
                self.options.batch_timeout,
                target.insert_rows(&table.name, &columns, &rows),
            )
            .await
            {
                Ok(written) => {
                    record.rows_loaded += written;
                    record.batches += 1;
                    debug!(
                        "{}: batch {} ({} rows, {} total)",
                        table.name, record.batches, written, record.rows_loaded
                    );
                }
                Err(e) => return fail(record, e),
            }

            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }

        if let Some(expected) = record.source_rows {
            if record.rows_loaded as i64 != expected {
                warn!(
                    "{}: loaded {} rows, source reported {}",
                    table.name, record.rows_loaded, expected
                );
            }
        }
        info!(
            "{}: {} rows in {} batches",
            table.name, record.rows_loaded, record.batches
        );
        record.timestamp = Utc::now();
        record
    }
}
