//! Migration orchestrator - run lifecycle coordinator.
//!
//! A run plans once, then makes the same pass (deploy, load, deferred
//! constraints, validate) against the verification database and, if that
//! pass is good enough, against the production target.

use crate::config::Config;
use crate::db::{
    with_timeout, ConnectionDescriptor, MysqlSource, PgTarget, SourceDatabase, TargetDatabase,
    TargetRole,
};
use crate::deploy::{DeploySummary, ExecutorOptions, PhasedDeploymentExecutor};
use crate::error::{MigrateError, Result};
use crate::load::{LoadSummary, LoaderOptions, StreamingDataMigrator};
use crate::plan::{DependencyGraphBuilder, DeploymentPlan};
use crate::schema::{SchemaDescription, SchemaObject};
use crate::state::{MigrationState, Phase, RunStatus, TableLoadRecord};
use crate::validate::{ValidationEngine, ValidationRecord, ValidationReport, ValidationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    schema: SchemaDescription,
    objects: Vec<SchemaObject>,
    state_file: Option<PathBuf>,
    state: Option<MigrationState>,
}

/// Result of one pass against one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub target: TargetRole,
    pub endpoint: ConnectionDescriptor,
    pub schema: DeploySummary,
    pub deferred_constraints: DeploySummary,
    pub data: LoadSummary,
    pub validation: ValidationStatus,
    pub failed_checks: usize,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    /// Objects in the plan, deferred constraints included.
    pub planned_objects: usize,

    /// Tables in data-load order.
    pub data_order: Vec<String>,

    pub verification: Option<PassReport>,
    pub production: Option<PassReport>,

    /// Why production was not attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,

    /// Final table load records of every pass.
    pub loads: Vec<TableLoadRecord>,

    /// Validation records of every pass.
    pub validations: Vec<ValidationRecord>,
}

impl RunReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connectivity of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub name: String,
    pub endpoint: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub endpoints: Vec<EndpointHealth>,
    pub healthy: bool,
}

impl Orchestrator {
    /// Create an orchestrator over introspected metadata and transformed objects.
    pub fn new(config: Config, schema: SchemaDescription, objects: Vec<SchemaObject>) -> Self {
        Self {
            config,
            schema,
            objects,
            state_file: None,
            state: None,
        }
    }

    /// Persist the state to this file after every phase.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Continue the run recorded in the state file, if there is one.
    ///
    /// The history is kept and appended to; the plan must rebuild identically.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = MigrationState::load(path)?;
                state.validate_config(&self.config.hash())?;
                info!("Resuming run {} from state file: {:?}", state.run_id, path);
                self.state = Some(state);
            }
        }
        Ok(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the deployment plan. No database access.
    pub fn plan(&self) -> Result<DeploymentPlan> {
        let builder =
            DependencyGraphBuilder::new().defer_cycles(self.config.migration.defer_cyclic_constraints);
        DeploymentPlan::build(&self.schema, self.objects.clone(), &builder)
    }

    /// Connect to the configured databases and run the full lifecycle.
    pub async fn run(&mut self, cancel: &CancellationToken, skip_verification: bool) -> Result<RunReport> {
        let m = &self.config.migration;
        let source = MysqlSource::connect(&self.config.source, m.get_max_source_connections()).await?;

        let verification = match (&self.config.verification, skip_verification) {
            (Some(cfg), false) => Some(
                PgTarget::connect(
                    cfg,
                    TargetRole::Verification,
                    m.get_max_target_connections(),
                    m.statement_timeout(),
                )
                .await?,
            ),
            (Some(_), true) => {
                warn!("Skipping the verification pass");
                None
            }
            (None, _) => None,
        };

        let production = PgTarget::connect(
            &self.config.target,
            TargetRole::Production,
            m.get_max_target_connections(),
            m.statement_timeout(),
        )
        .await?;

        self.execute(
            &source,
            verification.as_ref().map(|t| t as &dyn TargetDatabase),
            &production,
            cancel,
        )
        .await
    }

    /// Run the lifecycle against already connected databases.
    pub async fn execute(
        &mut self,
        source: &dyn SourceDatabase,
        verification: Option<&dyn TargetDatabase>,
        production: &dyn TargetDatabase,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut state = self.state.take().unwrap_or_else(|| {
            MigrationState::new(uuid::Uuid::new_v4().to_string(), self.config.hash())
        });
        let started_at = state.started_at;
        state.status = RunStatus::Running;
        state.completed_at = None;
        info!("Starting migration run: {}", state.run_id);

        state.set_source(source.descriptor());
        state.mark_phase(Phase::Introspected, None);
        info!(
            "Phase 1: {} tables described, {} objects to deploy",
            self.schema.tables.len(),
            self.objects.len()
        );
        self.save_state(&mut state)?;

        info!("Phase 2: Planning");
        let plan = match self.plan().and_then(|plan| {
            state.set_plan(plan.clone())?;
            Ok(plan)
        }) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Planning failed: {}", e);
                return Err(self.abort(&mut state, e));
            }
        };
        state.mark_phase(Phase::Planned, None);
        self.save_state(&mut state)?;

        let mut verification_report = None;
        let mut gate = None;

        if let Some(verification) = verification {
            info!("Phase 3: Verification pass on {}", verification.descriptor());
            state.set_target(TargetRole::Verification, verification.descriptor());
            if self.config.migration.reset_verification_target {
                let limit = self.config.migration.statement_timeout();
                if let Err(e) = with_timeout("verification reset", limit, verification.reset()).await {
                    error!("Could not reset the verification database: {}", e);
                    return Err(self.abort(&mut state, e));
                }
            }
            let report = match self.run_pass(&plan, source, verification, &mut state, cancel).await {
                Ok(report) => report,
                Err(e) => return Err(self.abort(&mut state, e)),
            };

            let promote = match report.validation {
                ValidationStatus::Success => true,
                ValidationStatus::Partial => self.config.migration.promote_partial,
                ValidationStatus::Failed => false,
            };
            if !promote {
                let reason = format!(
                    "verification pass finished {} with {} failing checks",
                    report.validation, report.failed_checks
                );
                warn!("Production pass not attempted: {}", reason);
                gate = Some(reason);
            }
            verification_report = Some(report);
        }

        let mut production_report = None;
        if gate.is_none() {
            info!("Phase 4: Production pass on {}", production.descriptor());
            state.set_target(TargetRole::Production, production.descriptor());
            match self.run_pass(&plan, source, production, &mut state, cancel).await {
                Ok(report) => production_report = Some(report),
                Err(e) => return Err(self.abort(&mut state, e)),
            }
        }

        let status = match (&production_report, &gate) {
            (Some(report), _) => match report.validation {
                ValidationStatus::Success => RunStatus::Success,
                ValidationStatus::Partial => RunStatus::Partial,
                ValidationStatus::Failed => RunStatus::Failed,
            },
            _ => RunStatus::Failed,
        };
        state.finish(status);
        self.save_state(&mut state)?;

        let report = RunReport {
            run_id: state.run_id.clone(),
            status,
            started_at,
            completed_at: state.completed_at.unwrap_or_else(Utc::now),
            duration_seconds: started.elapsed().as_secs_f64(),
            planned_objects: plan.object_count(),
            data_order: plan.data_order.clone(),
            verification: verification_report,
            production: production_report,
            gate,
            loads: state.loads().to_vec(),
            validations: state.validations().to_vec(),
        };
        info!(
            "Migration {:?}: {} objects planned in {:.1}s",
            report.status, report.planned_objects, report.duration_seconds
        );
        self.state = Some(state);
        Ok(report)
    }

    /// Deploy, load, apply deferred constraints and validate one target.
    /// Identical for both targets.
    async fn run_pass(
        &self,
        plan: &DeploymentPlan,
        source: &dyn SourceDatabase,
        target: &dyn TargetDatabase,
        state: &mut MigrationState,
        cancel: &CancellationToken,
    ) -> Result<PassReport> {
        let m = &self.config.migration;
        let executor = PhasedDeploymentExecutor::new(ExecutorOptions::from_config(m));
        let migrator = StreamingDataMigrator::new(LoaderOptions::from_config(m));
        let validator =
            ValidationEngine::new(m.statement_timeout()).foreign_key_checks(m.check_foreign_keys);

        let schema = executor.deploy(plan, target, state, cancel).await;
        self.save_state(state)?;
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let data = migrator
            .migrate(plan, &self.schema, source, target, state, cancel)
            .await?;
        self.save_state(state)?;
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let deferred_constraints = executor
            .apply_deferred_constraints(plan, target, state, cancel)
            .await;
        if cancel.is_cancelled() {
            self.save_state(state)?;
            return Err(MigrateError::Cancelled);
        }

        let validation = validator
            .validate(plan, &self.schema, Some(source), target, state)
            .await;
        self.save_state(state)?;

        Ok(PassReport {
            target: target.role(),
            endpoint: target.descriptor(),
            schema,
            deferred_constraints,
            data,
            validation: validation.status,
            failed_checks: validation.failures().count(),
        })
    }

    /// Validate the production target only, without deploying or loading.
    pub async fn validate_only(
        &self,
        source: Option<&dyn SourceDatabase>,
        target: &dyn TargetDatabase,
    ) -> Result<ValidationReport> {
        let plan = self.plan()?;
        let mut state = MigrationState::new(uuid::Uuid::new_v4().to_string(), self.config.hash());
        state.set_plan(plan.clone())?;
        let m = &self.config.migration;
        let validator =
            ValidationEngine::new(m.statement_timeout()).foreign_key_checks(m.check_foreign_keys);
        Ok(validator
            .validate(&plan, &self.schema, source, target, &mut state)
            .await)
    }

    /// Connect to the configured databases and run `validate_only`.
    pub async fn validate(&self) -> Result<ValidationReport> {
        let m = &self.config.migration;
        let source = MysqlSource::connect(&self.config.source, m.get_max_source_connections()).await?;
        let target = PgTarget::connect(
            &self.config.target,
            TargetRole::Production,
            m.get_max_target_connections(),
            m.statement_timeout(),
        )
        .await?;
        self.validate_only(Some(&source), &target).await
    }

    /// Test connectivity to the source and every configured target.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let m = &self.config.migration;
        let limit = m.statement_timeout();
        let mut endpoints = Vec::new();

        let started = Instant::now();
        let source = with_timeout(
            "source connection",
            limit,
            MysqlSource::connect(&self.config.source, 1),
        )
        .await;
        endpoints.push(EndpointHealth {
            name: "source".into(),
            endpoint: format!(
                "mysql://{}:{}/{}",
                self.config.source.host, self.config.source.port, self.config.source.database
            ),
            connected: source.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            error: source.err().map(|e| e.to_string()),
        });

        let mut targets = vec![(TargetRole::Production, &self.config.target)];
        if let Some(verification) = &self.config.verification {
            targets.push((TargetRole::Verification, verification));
        }
        for (role, cfg) in targets {
            let started = Instant::now();
            let target = with_timeout(
                "target connection",
                limit,
                PgTarget::connect(cfg, role, 2, limit),
            )
            .await;
            endpoints.push(EndpointHealth {
                name: role.to_string(),
                endpoint: format!("postgres://{}", cfg.describe()),
                connected: target.is_ok(),
                latency_ms: started.elapsed().as_millis() as u64,
                error: target.err().map(|e| e.to_string()),
            });
        }

        let healthy = endpoints.iter().all(|e| e.connected);
        Ok(HealthCheckResult { endpoints, healthy })
    }

    /// The state of the last executed run.
    pub fn state(&self) -> Option<&MigrationState> {
        self.state.as_ref()
    }

    /// Mark the run failed or cancelled, flush the state, hand back the error.
    fn abort(&mut self, state: &mut MigrationState, err: MigrateError) -> MigrateError {
        let status = match err {
            MigrateError::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        state.finish(status);
        if let Err(save_err) = self.save_state(state) {
            error!("Could not save state after {:?} run: {}", status, save_err);
        }
        self.state = Some(state.clone());
        err
    }

    /// Save state to file.
    fn save_state(&self, state: &mut MigrationState) -> Result<()> {
        if let Some(ref path) = self.state_file {
            state.save(path)?;
        }
        Ok(())
    }
}
