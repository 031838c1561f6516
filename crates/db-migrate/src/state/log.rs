//! Append-only records of what a run did.

use crate::db::TargetRole;
use crate::schema::ObjectKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of applying one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Skipped,
    Failed,
    AutoFixedAndApplied,
}

/// Per-statement result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub target: TargetRole,
    pub object: String,
    pub kind: ObjectKind,
    /// Position of the statement inside the object's payload.
    pub statement_index: usize,
    /// Applied after the data load as a deferred constraint.
    #[serde(default)]
    pub deferred: bool,
    pub outcome: Outcome,
    /// Error text of the last attempt, or the reason for a skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Name of the remediation that rewrote the statement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    pub statement: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered execution records. There is no way to modify or remove an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionLog {
    records: Vec<ExecutionRecord>,
}

impl ExecutionLog {
    pub fn append(&mut self, record: ExecutionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn for_target(&self, target: TargetRole) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.iter().filter(move |r| r.target == target)
    }

    pub fn count(&self, target: TargetRole, outcome: Outcome) -> usize {
        self.for_target(target).filter(|r| r.outcome == outcome).count()
    }
}

/// How a table's load ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    Failed,
    Skipped,
}

/// Data load result for one table on one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLoadRecord {
    pub target: TargetRole,
    pub table: String,
    pub status: LoadStatus,
    /// Source row count when the load started.
    pub source_rows: Option<i64>,
    /// Rows written before the load ended.
    pub rows_loaded: u64,
    pub batches: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Sequence reset after loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceResetRecord {
    pub target: TargetRole,
    pub table: String,
    pub column: String,
    /// Next value the sequence hands out; `None` if the column has no sequence.
    pub next_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(target: TargetRole, outcome: Outcome) -> ExecutionRecord {
        ExecutionRecord {
            target,
            object: "users".into(),
            kind: ObjectKind::Table,
            statement_index: 0,
            deferred: false,
            outcome,
            error: None,
            remediation: None,
            statement: "CREATE TABLE users (id int)".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_counts_per_target() {
        let mut log = ExecutionLog::default();
        log.append(record(TargetRole::Verification, Outcome::Applied));
        log.append(record(TargetRole::Verification, Outcome::Failed));
        log.append(record(TargetRole::Production, Outcome::Applied));
        assert_eq!(log.len(), 3);
        assert_eq!(log.count(TargetRole::Verification, Outcome::Applied), 1);
        assert_eq!(log.count(TargetRole::Verification, Outcome::Failed), 1);
        assert_eq!(log.count(TargetRole::Production, Outcome::Applied), 1);
        assert_eq!(log.for_target(TargetRole::Production).count(), 1);
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&Outcome::AutoFixedAndApplied).unwrap();
        assert_eq!(json, "\"auto_fixed_and_applied\"");
    }

    #[test]
    fn test_log_serializes_as_array() {
        let mut log = ExecutionLog::default();
        log.append(record(TargetRole::Production, Outcome::Skipped));
        let value = serde_json::to_value(&log).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["outcome"], "skipped");
        assert!(value[0].get("error").is_none());
    }
}
