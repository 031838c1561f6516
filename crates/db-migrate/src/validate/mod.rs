//! Post-migration reconciliation of object existence, row counts and
//! foreign-key integrity.

use crate::db::{with_timeout, SourceDatabase, TargetDatabase, TargetRole};
use crate::error::Result;
use crate::plan::DeploymentPlan;
use crate::schema::{ObjectKind, SchemaDescription, TableMeta};
use crate::state::{MigrationState, Phase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a record checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckKind {
    Existence,
    RowCount,
    /// Child rows whose foreign key matches no parent row.
    ForeignKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
}

/// Expected or observed value of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observation {
    Exists,
    Missing,
    Rows(i64),
    /// The value could not be obtained.
    Unavailable,
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observation::Exists => f.write_str("exists"),
            Observation::Missing => f.write_str("missing"),
            Observation::Rows(n) => write!(f, "{} rows", n),
            Observation::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// One reconciliation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub target: TargetRole,
    pub object_name: String,
    pub kind: ObjectKind,
    pub check: CheckKind,
    pub expected: Observation,
    pub actual: Observation,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ValidationRecord {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

/// Overall outcome of a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Every check passed.
    Success,
    /// Tables exist but some other check failed.
    Partial,
    /// A planned table is missing.
    Failed,
}

impl ValidationStatus {
    pub fn from_records(records: &[ValidationRecord]) -> Self {
        let table_missing = records.iter().any(|r| {
            r.kind == ObjectKind::Table && r.check == CheckKind::Existence && !r.passed()
        });
        if table_missing {
            ValidationStatus::Failed
        } else if records.iter().all(ValidationRecord::passed) {
            ValidationStatus::Success
        } else {
            ValidationStatus::Partial
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Success => f.write_str("success"),
            ValidationStatus::Partial => f.write_str("partial"),
            ValidationStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub records: Vec<ValidationRecord>,
}

impl ValidationReport {
    pub fn failures(&self) -> impl Iterator<Item = &ValidationRecord> {
        self.records.iter().filter(|r| !r.passed())
    }
}

/// Checks a target against the plan. Never fails: mismatches and query
/// errors become failing records.
pub struct ValidationEngine {
    timeout: Duration,
    check_foreign_keys: bool,
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl ValidationEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            check_foreign_keys: true,
        }
    }

    /// Enable or disable orphan-row counting per foreign key.
    pub fn foreign_key_checks(mut self, enabled: bool) -> Self {
        self.check_foreign_keys = enabled;
        self
    }

    /// Check that every planned object and every table in the load order
    /// exists, that every loaded table holds as many rows as the source had
    /// when it was copied, and that no foreign key points at a missing row.
    ///
    /// The expected count comes from this target's load record; without one
    /// it is read from `source`, then from the introspected metadata.
    pub async fn validate(
        &self,
        plan: &DeploymentPlan,
        schema: &SchemaDescription,
        source: Option<&dyn SourceDatabase>,
        target: &dyn TargetDatabase,
        state: &mut MigrationState,
    ) -> ValidationReport {
        let role = target.role();
        let mut records = Vec::new();

        for planned in plan.objects() {
            let object = &planned.object;
            records.push(self.existence(target, &object.name, object.kind).await);
        }

        // Tables described by introspection but never transformed still load
        let planned_tables: BTreeSet<&str> = plan
            .objects()
            .filter(|p| p.object.kind == ObjectKind::Table)
            .map(|p| p.object.name.as_str())
            .collect();
        for name in &plan.data_order {
            if !planned_tables.contains(name.as_str()) {
                records.push(self.existence(target, name, ObjectKind::Table).await);
            }
        }

        for name in &plan.data_order {
            let Some(table) = schema.table(name) else {
                continue;
            };
            let expected = self.expected_rows(table, source, state, role).await;
            let (actual, detail) = match with_timeout(
                "row count",
                self.timeout,
                target.row_count(&table.name),
            )
            .await
            {
                Ok(n) => (Observation::Rows(n), None),
                Err(e) => (Observation::Unavailable, Some(e.detail())),
            };
            let detail = detail.or_else(|| match (&expected, &actual) {
                (Observation::Unavailable, _) => Some("source row count unavailable".to_string()),
                (Observation::Rows(e), Observation::Rows(a)) if e != a => {
                    Some(format!("expected {} rows, found {}", e, a))
                }
                _ => None,
            });
            records.push(record(
                role,
                &table.name,
                ObjectKind::Table,
                CheckKind::RowCount,
                expected,
                actual,
                detail,
            ));
        }

        if self.check_foreign_keys {
            for name in &plan.data_order {
                let Some(table) = schema.table(name) else {
                    continue;
                };
                for fk in &table.foreign_keys {
                    if !fk.is_checkable() {
                        debug!("{}: no column pairs, orphan check skipped", fk.label(name));
                        continue;
                    }
                    let (actual, detail) = match with_timeout(
                        "orphan count",
                        self.timeout,
                        target.orphan_rows(name, fk),
                    )
                    .await
                    {
                        Ok(0) => (Observation::Rows(0), None),
                        Ok(n) => (
                            Observation::Rows(n),
                            Some(format!(
                                "{} rows in {} reference missing {} rows",
                                n, name, fk.ref_table
                            )),
                        ),
                        Err(e) => (Observation::Unavailable, Some(e.detail())),
                    };
                    records.push(record(
                        role,
                        &fk.label(name),
                        ObjectKind::Constraint,
                        CheckKind::ForeignKey,
                        Observation::Rows(0),
                        actual,
                        detail,
                    ));
                }
            }
        }

        let status = ValidationStatus::from_records(&records);
        for failure in records.iter().filter(|r| !r.passed()) {
            warn!(
                "{} {:?} check failed for {}: expected {}, found {}",
                role, failure.check, failure.object_name, failure.expected, failure.actual
            );
        }
        for r in &records {
            state.append_validation(r.clone());
        }
        state.mark_phase(Phase::Validated, Some(role));
        info!(
            "Validation of {} target: {} ({} checks, {} failing)",
            role,
            status,
            records.len(),
            records.iter().filter(|r| !r.passed()).count()
        );

        ValidationReport { status, records }
    }

    async fn existence(
        &self,
        target: &dyn TargetDatabase,
        name: &str,
        kind: ObjectKind,
    ) -> ValidationRecord {
        let lookup = with_timeout(
            "existence check",
            self.timeout,
            target.object_exists(name, kind),
        )
        .await;
        let (actual, detail) = match lookup {
            Ok(true) => (Observation::Exists, None),
            Ok(false) => (Observation::Missing, None),
            Err(e) => (Observation::Unavailable, Some(e.detail())),
        };
        record(
            target.role(),
            name,
            kind,
            CheckKind::Existence,
            Observation::Exists,
            actual,
            detail,
        )
    }

    async fn expected_rows(
        &self,
        table: &TableMeta,
        source: Option<&dyn SourceDatabase>,
        state: &MigrationState,
        role: TargetRole,
    ) -> Observation {
        if let Some(rows) = state.last_load(role, &table.name).and_then(|l| l.source_rows) {
            return Observation::Rows(rows);
        }
        if let Some(source) = source {
            let counted: Result<i64> =
                with_timeout("source row count", self.timeout, source.row_count(table)).await;
            match counted {
                Ok(n) => return Observation::Rows(n),
                Err(e) => warn!("{}: source row count failed: {}", table.name, e),
            }
        }
        table
            .row_count
            .map(Observation::Rows)
            .unwrap_or(Observation::Unavailable)
    }
}

fn record(
    target: TargetRole,
    name: &str,
    kind: ObjectKind,
    check: CheckKind,
    expected: Observation,
    actual: Observation,
    detail: Option<String>,
) -> ValidationRecord {
    let status = if expected == actual && expected != Observation::Unavailable {
        CheckStatus::Pass
    } else {
        CheckStatus::Fail
    };
    ValidationRecord {
        target,
        object_name: name.to_string(),
        kind,
        check,
        expected,
        actual,
        status,
        detail,
    }
}
