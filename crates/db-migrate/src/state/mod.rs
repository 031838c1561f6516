//! Run context shared by every component, with file persistence.
//!
//! `MigrationState` is created once per run and passed by reference into each
//! component call. Components only append to it.

mod log;

pub use log::{
    ExecutionLog, ExecutionRecord, LoadStatus, Outcome, SequenceResetRecord, TableLoadRecord,
};

use crate::db::{ConnectionDescriptor, TargetRole};
use crate::error::{MigrateError, Result};
use crate::plan::DeploymentPlan;
use crate::validate::ValidationRecord;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Lifecycle position of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Introspected,
    Planned,
    SchemaDeployed,
    DataLoaded,
    Validated,
}

/// When a phase was reached, and on which target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMark {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetRole>,
    pub at: DateTime<Utc>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

/// Migration run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// Current run status.
    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<ConnectionDescriptor>,

    #[serde(default)]
    targets: BTreeMap<TargetRole, ConnectionDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    plan: Option<DeploymentPlan>,

    #[serde(default)]
    phases: Vec<PhaseMark>,

    #[serde(default)]
    execution: ExecutionLog,

    #[serde(default)]
    loads: Vec<TableLoadRecord>,

    #[serde(default)]
    sequences: Vec<SequenceResetRecord>,

    #[serde(default)]
    validations: Vec<ValidationRecord>,

    /// When the migration completed (if finished).
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 signature for integrity validation.
    /// Computed over serialized state (excluding this field) using config_hash as key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl MigrationState {
    /// Create a new migration state.
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            source: None,
            targets: BTreeMap::new(),
            plan: None,
            phases: Vec::new(),
            execution: ExecutionLog::default(),
            loads: Vec::new(),
            sequences: Vec::new(),
            validations: Vec::new(),
            completed_at: None,
            hmac: None,
        }
    }

    pub fn set_source(&mut self, source: ConnectionDescriptor) {
        self.source = Some(source);
    }

    pub fn set_target(&mut self, role: TargetRole, target: ConnectionDescriptor) {
        self.targets.insert(role, target);
    }

    pub fn source(&self) -> Option<&ConnectionDescriptor> {
        self.source.as_ref()
    }

    pub fn target(&self, role: TargetRole) -> Option<&ConnectionDescriptor> {
        self.targets.get(&role)
    }

    /// Record the plan. A run keeps one plan; a resumed run must rebuild the same one.
    pub fn set_plan(&mut self, plan: DeploymentPlan) -> Result<()> {
        match &self.plan {
            Some(existing) if existing.ordering() != plan.ordering() => Err(MigrateError::State(
                "deployment plan differs from the one recorded for this run".into(),
            )),
            Some(_) => Ok(()),
            None => {
                self.plan = Some(plan);
                Ok(())
            }
        }
    }

    pub fn plan(&self) -> Option<&DeploymentPlan> {
        self.plan.as_ref()
    }

    pub fn mark_phase(&mut self, phase: Phase, target: Option<TargetRole>) {
        self.phases.push(PhaseMark {
            phase,
            target,
            at: Utc::now(),
        });
    }

    /// Most recently reached phase.
    pub fn phase(&self) -> Option<Phase> {
        self.phases.last().map(|m| m.phase)
    }

    pub fn phase_history(&self) -> &[PhaseMark] {
        &self.phases
    }

    pub fn append_execution(&mut self, record: ExecutionRecord) {
        self.execution.append(record);
    }

    pub fn execution_log(&self) -> &ExecutionLog {
        &self.execution
    }

    pub fn append_load(&mut self, record: TableLoadRecord) {
        self.loads.push(record);
    }

    pub fn loads(&self) -> &[TableLoadRecord] {
        &self.loads
    }

    /// Latest load of `table` on `target`.
    pub fn last_load(&self, target: TargetRole, table: &str) -> Option<&TableLoadRecord> {
        self.loads
            .iter()
            .rev()
            .find(|l| l.target == target && l.table == table)
    }

    pub fn append_sequence_reset(&mut self, record: SequenceResetRecord) {
        self.sequences.push(record);
    }

    pub fn sequence_resets(&self) -> &[SequenceResetRecord] {
        &self.sequences
    }

    pub fn append_validation(&mut self, record: ValidationRecord) {
        self.validations.push(record);
    }

    pub fn validations(&self) -> &[ValidationRecord] {
        &self.validations
    }

    /// Compute HMAC-SHA256 signature for state integrity validation.
    ///
    /// Uses config_hash as HMAC key so a state file cannot be edited without
    /// also knowing the configuration.
    fn compute_hmac(&self) -> Result<String> {
        let mut state_for_signing = self.clone();
        state_for_signing.hmac = None;

        let content = serde_json::to_string(&state_for_signing)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load state from a file with integrity validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match &state.hmac {
            Some(stored) => {
                if stored != &state.compute_hmac()? {
                    return Err(MigrateError::State(
                        "State file integrity check failed: HMAC mismatch (possible tampering)".to_string(),
                    ));
                }
            }
            None => {
                tracing::warn!("State file has no HMAC signature, integrity cannot be verified");
            }
        }

        Ok(state)
    }

    /// Save state to a file (atomic write with HMAC).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    /// Set the terminal status.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}
