//! Phased schema deployment.
//!
//! Tiers run strictly in order. Every statement is executed on its own, so a
//! failure never rolls back or blocks a sibling. A failure matching a known
//! signature is rewritten and retried exactly once.

mod remediation;

pub use remediation::{is_already_exists, rewrite_index_method_to_gist, Remediation, RemediationTable};

use crate::config::MigrationConfig;
use crate::db::{with_timeout, TargetDatabase};
use crate::error::Result;
use crate::plan::{DeploymentPlan, PlannedObject};
use crate::sql::{StatementSplitter, DEFAULT_BLOCK_MARKER};
use crate::state::{ExecutionRecord, MigrationState, Outcome, Phase};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CANCELLED: &str = "run cancelled before the statement was attempted";

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Bound on a single statement, retries included separately.
    pub statement_timeout: Duration,
    /// Objects of the same tier and rank applied at once.
    pub concurrency: usize,
    /// Marker delimiting procedural bodies.
    pub block_marker: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(300),
            concurrency: 1,
            block_marker: DEFAULT_BLOCK_MARKER.to_string(),
        }
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            statement_timeout: config.statement_timeout(),
            concurrency: config.get_tier_concurrency(),
            block_marker: config.block_marker.clone(),
        }
    }
}

/// Outcome counts for one deployment call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySummary {
    pub applied: usize,
    pub auto_fixed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DeploySummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::AutoFixedAndApplied => self.auto_fixed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: DeploySummary) {
        self.applied += other.applied;
        self.auto_fixed += other.auto_fixed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.applied + self.auto_fixed + self.skipped + self.failed
    }
}

struct StatementResult {
    outcome: Outcome,
    statement: String,
    error: Option<String>,
    remediation: Option<String>,
}

/// Applies a plan to one target. The target only labels the records.
pub struct PhasedDeploymentExecutor {
    options: ExecutorOptions,
    splitter: StatementSplitter,
    remediations: RemediationTable,
}

impl PhasedDeploymentExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        let splitter = StatementSplitter::new(options.block_marker.clone());
        Self {
            options,
            splitter,
            remediations: RemediationTable::default(),
        }
    }

    /// Replace the remediation table.
    pub fn with_remediations(mut self, remediations: RemediationTable) -> Self {
        self.remediations = remediations;
        self
    }

    /// Apply every tier of the plan except the deferred constraints.
    pub async fn deploy(
        &self,
        plan: &DeploymentPlan,
        target: &dyn TargetDatabase,
        state: &mut MigrationState,
        cancel: &CancellationToken,
    ) -> DeploySummary {
        let role = target.role();
        info!("Deploying schema to {} target {}", role, target.descriptor());

        let mut summary = DeploySummary::default();
        for tier in &plan.tiers {
            if tier.objects.is_empty() {
                continue;
            }
            info!("Tier {}: {} objects", tier.kind, tier.objects.len());
            let tier_summary = self.apply_objects(&tier.objects, false, target, state, cancel).await;
            if tier_summary.failed > 0 {
                warn!(
                    "Tier {}: {} of {} statements failed",
                    tier.kind,
                    tier_summary.failed,
                    tier_summary.total()
                );
            }
            summary.merge(tier_summary);
        }

        state.mark_phase(Phase::SchemaDeployed, Some(role));
        info!(
            "Schema deployed to {}: {} applied, {} auto-fixed, {} skipped, {} failed",
            role, summary.applied, summary.auto_fixed, summary.skipped, summary.failed
        );
        summary
    }

    /// Apply constraints on cyclic and self-referencing tables, after the data load.
    pub async fn apply_deferred_constraints(
        &self,
        plan: &DeploymentPlan,
        target: &dyn TargetDatabase,
        state: &mut MigrationState,
        cancel: &CancellationToken,
    ) -> DeploySummary {
        if plan.deferred_constraints.is_empty() {
            return DeploySummary::default();
        }
        info!(
            "Applying {} deferred constraints to {} target",
            plan.deferred_constraints.len(),
            target.role()
        );
        self.apply_objects(&plan.deferred_constraints, true, target, state, cancel)
            .await
    }

    /// Objects run rank by rank; within a rank up to `concurrency` at once.
    /// Records are appended in plan order whatever order objects finish in.
    async fn apply_objects(
        &self,
        objects: &[PlannedObject],
        deferred: bool,
        target: &dyn TargetDatabase,
        state: &mut MigrationState,
        cancel: &CancellationToken,
    ) -> DeploySummary {
        let mut summary = DeploySummary::default();
        let concurrency = self.options.concurrency.max(1);

        let mut start = 0;
        while start < objects.len() {
            let rank = objects[start].rank;
            let end = objects[start..]
                .iter()
                .position(|o| o.rank != rank)
                .map(|p| start + p)
                .unwrap_or(objects.len());

            let mut results = stream::iter(
                objects[start..end]
                    .iter()
                    .map(|planned| self.apply_object(planned, deferred, target, cancel)),
            )
            .buffered(concurrency);

            while let Some(records) = results.next().await {
                for record in records {
                    summary.record(record.outcome);
                    state.append_execution(record);
                }
            }
            start = end;
        }

        summary
    }

    async fn apply_object(
        &self,
        planned: &PlannedObject,
        deferred: bool,
        target: &dyn TargetDatabase,
        cancel: &CancellationToken,
    ) -> Vec<ExecutionRecord> {
        let object = &planned.object;
        let statements = self.splitter.split(&object.payload);
        let record = |index: usize, result: StatementResult| ExecutionRecord {
            target: target.role(),
            object: object.name.clone(),
            kind: object.kind,
            statement_index: index,
            deferred,
            outcome: result.outcome,
            error: result.error,
            remediation: result.remediation,
            statement: result.statement,
            timestamp: Utc::now(),
        };

        if statements.is_empty() {
            warn!("{} '{}' has no executable statements", object.kind, object.name);
            return vec![record(
                0,
                StatementResult {
                    outcome: Outcome::Failed,
                    statement: String::new(),
                    error: Some("payload contains no statements".into()),
                    remediation: None,
                },
            )];
        }

        let mut records = Vec::with_capacity(statements.len());
        for (index, statement) in statements.into_iter().enumerate() {
            let result = if cancel.is_cancelled() {
                StatementResult {
                    outcome: Outcome::Skipped,
                    statement,
                    error: Some(CANCELLED.into()),
                    remediation: None,
                }
            } else {
                self.apply_statement(statement, target).await
            };

            match result.outcome {
                Outcome::Applied => debug!("{} '{}' [{}]: applied", object.kind, object.name, index),
                Outcome::AutoFixedAndApplied => warn!(
                    "{} '{}' [{}]: applied after {}",
                    object.kind,
                    object.name,
                    index,
                    result.remediation.as_deref().unwrap_or_default()
                ),
                Outcome::Skipped => debug!(
                    "{} '{}' [{}]: skipped ({})",
                    object.kind,
                    object.name,
                    index,
                    result.error.as_deref().unwrap_or_default()
                ),
                Outcome::Failed => warn!(
                    "{} '{}' [{}]: failed: {}",
                    object.kind,
                    object.name,
                    index,
                    result.error.as_deref().unwrap_or_default()
                ),
            }

            records.push(record(index, result));
        }
        records
    }

    /// Execute, classify, and retry at most once.
    async fn apply_statement(&self, statement: String, target: &dyn TargetDatabase) -> StatementResult {
        let err = match self.execute_bounded(target, &statement).await {
            Ok(()) => {
                return StatementResult {
                    outcome: Outcome::Applied,
                    statement,
                    error: None,
                    remediation: None,
                }
            }
            Err(e) => e,
        };

        if err.is_timeout() {
            return StatementResult {
                outcome: Outcome::Failed,
                statement,
                error: Some(err.to_string()),
                remediation: None,
            };
        }

        let detail = err.detail();
        if is_already_exists(&detail) {
            return StatementResult {
                outcome: Outcome::Skipped,
                statement,
                error: Some(detail),
                remediation: None,
            };
        }

        let Some((remediation, rewritten)) = self.remediations.find(&detail, &statement) else {
            return StatementResult {
                outcome: Outcome::Failed,
                statement,
                error: Some(detail),
                remediation: None,
            };
        };

        debug!("Retrying with {}: {}", remediation.name(), rewritten);
        match self.execute_bounded(target, &rewritten).await {
            Ok(()) => StatementResult {
                outcome: Outcome::AutoFixedAndApplied,
                statement: rewritten,
                error: Some(detail),
                remediation: Some(remediation.name().to_string()),
            },
            Err(retry_err) => StatementResult {
                outcome: Outcome::Failed,
                statement,
                error: Some(if retry_err.is_timeout() {
                    retry_err.to_string()
                } else {
                    retry_err.detail()
                }),
                remediation: Some(remediation.name().to_string()),
            },
        }
    }

    async fn execute_bounded(&self, target: &dyn TargetDatabase, sql: &str) -> Result<()> {
        with_timeout("statement", self.options.statement_timeout, target.execute(sql)).await
    }
}
