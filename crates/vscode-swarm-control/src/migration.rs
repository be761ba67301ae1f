//! Cross-provider migration.
//!
//! A migration plan is an ordered list of steps executed strictly in
//! sequence. A failed step halts the plan as `failed` and leaves every effect
//! of the completed steps in place for an operator to inspect. There is no
//! automatic rollback. Cancellation takes effect between steps.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vscode_swarm_core::{InstanceId, PlanId};
use vscode_swarm_store::{InstanceConfig, InstanceStatus, ProviderType, VSCodeInstance};

use crate::config::MigrationConfig;
use crate::error::{ControlError, Result};
use crate::fleet::Fleet;

/// Order in which the source is retired and the target brought up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    /// Stop the source before creating the target.
    #[default]
    StopAndRecreate,
    /// Bring the target up before stopping the source.
    CreateThenStop,
}

/// Lifecycle of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Created, not started.
    Pending,
    /// Steps are executing.
    Running,
    /// Every step succeeded.
    Completed,
    /// A step failed.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl MigrationStatus {
    /// Whether the plan can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Stop the source instance.
    StopSource,
    /// Check the source config against the target provider.
    TranslateConfig,
    /// Create the target instance.
    CreateTarget,
    /// Start the target instance.
    StartTarget,
    /// Delete the source instance.
    DeleteSource,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StopSource => "stop_source",
            Self::TranslateConfig => "translate_config",
            Self::CreateTarget => "create_target",
            Self::StartTarget => "start_target",
            Self::DeleteSource => "delete_source",
        };
        f.write_str(s)
    }
}

/// Progress of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not reached yet.
    Pending,
    /// Executing.
    Running,
    /// Succeeded.
    Completed,
    /// Failed; the plan halted here.
    Failed,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    /// What the step does.
    pub kind: StepKind,
    /// Progress.
    pub status: StepStatus,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure message.
    pub error: Option<String>,
}

impl MigrationStep {
    const fn new(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Options for a new plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationOptions {
    /// Strategy, or the configured default.
    pub strategy: Option<MigrationStrategy>,
    /// Keep the source instance after the target is up.
    pub keep_source: bool,
    /// Start the target after creating it.
    pub start_target: bool,
    /// Plan lifetime, or the configured default.
    pub timeout_ms: Option<u64>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            keep_source: false,
            start_target: true,
            timeout_ms: None,
        }
    }
}

/// A migration of one instance to another provider type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    /// Plan id.
    pub id: PlanId,
    /// Instance being moved.
    pub source_instance_id: InstanceId,
    /// Provider the source lives on.
    pub source_provider_type: ProviderType,
    /// Provider to move to.
    pub target_provider_type: ProviderType,
    /// Step ordering.
    pub strategy: MigrationStrategy,
    /// Whether the source survives.
    pub keep_source: bool,
    /// Whether the target is started.
    pub start_target: bool,
    /// Plan lifetime.
    pub timeout_seconds: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Steps must finish before this instant.
    pub expires_at: DateTime<Utc>,
    /// Steps in execution order.
    pub steps: Vec<MigrationStep>,
    /// Index of the next step to run. Only moves forward.
    pub current_step_index: usize,
    /// Plan status.
    pub status: MigrationStatus,
    /// Config produced by the translate step.
    pub target_config: Option<InstanceConfig>,
    /// Instance created by the create step.
    pub target_instance_id: Option<InstanceId>,
    /// Failure message.
    pub error: Option<String>,
}

/// Outcome of `start_migration`.
#[derive(Debug, Clone)]
pub struct MigrationResult {
    /// Final plan.
    pub plan: MigrationPlan,
    /// Whether every step completed.
    pub success: bool,
    /// The target instance, if one was created.
    pub target_instance: Option<VSCodeInstance>,
}

/// Steps for a strategy.
#[must_use]
pub fn plan_steps(strategy: MigrationStrategy, start_target: bool, keep_source: bool) -> Vec<StepKind> {
    let mut steps = Vec::with_capacity(5);
    match strategy {
        MigrationStrategy::StopAndRecreate => {
            steps.push(StepKind::StopSource);
            steps.push(StepKind::TranslateConfig);
            steps.push(StepKind::CreateTarget);
            if start_target {
                steps.push(StepKind::StartTarget);
            }
        }
        MigrationStrategy::CreateThenStop => {
            steps.push(StepKind::TranslateConfig);
            steps.push(StepKind::CreateTarget);
            if start_target {
                steps.push(StepKind::StartTarget);
            }
            steps.push(StepKind::StopSource);
        }
    }
    if !keep_source {
        steps.push(StepKind::DeleteSource);
    }
    steps
}

/// Creates and executes migration plans.
pub struct MigrationManager {
    fleet: Arc<Fleet>,
    config: MigrationConfig,
    plans: RwLock<HashMap<PlanId, MigrationPlan>>,
    disposed: AtomicBool,
}

impl MigrationManager {
    /// Create a manager over a fleet.
    #[must_use]
    pub fn new(fleet: Arc<Fleet>, config: MigrationConfig) -> Self {
        Self {
            fleet,
            config,
            plans: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Whether plans can be created.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.disposed.load(Ordering::SeqCst)
    }

    /// Build a pending plan.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` if migration is disabled or the target
    /// type equals the source type, `ControlError::InstanceNotFound` for an
    /// unknown source, or `ControlError::ProviderUnavailable` for an inactive
    /// target.
    pub fn create_migration_plan(
        &self,
        source_instance_id: &InstanceId,
        target_provider_type: ProviderType,
        options: &MigrationOptions,
    ) -> Result<MigrationPlan> {
        if !self.is_enabled() {
            return Err(ControlError::Config("migration is disabled".into()));
        }
        let source = self
            .fleet
            .registry()
            .get_instance(source_instance_id)
            .ok_or(ControlError::InstanceNotFound(*source_instance_id))?;
        if source.provider_type == target_provider_type {
            return Err(ControlError::Config(format!(
                "instance {source_instance_id} already runs on {target_provider_type}"
            )));
        }
        self.fleet.provider(target_provider_type)?;

        let strategy = options.strategy.unwrap_or(self.config.default_strategy);
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.timeout_ms);
        let created_at = Utc::now();
        let lifetime = chrono::Duration::milliseconds(i64::try_from(timeout_ms).unwrap_or(i64::MAX));

        let plan = MigrationPlan {
            id: PlanId::generate(),
            source_instance_id: *source_instance_id,
            source_provider_type: source.provider_type,
            target_provider_type,
            strategy,
            keep_source: options.keep_source,
            start_target: options.start_target,
            timeout_seconds: timeout_ms.div_ceil(1000),
            created_at,
            expires_at: created_at + lifetime,
            steps: plan_steps(strategy, options.start_target, options.keep_source)
                .into_iter()
                .map(MigrationStep::new)
                .collect(),
            current_step_index: 0,
            status: MigrationStatus::Pending,
            target_config: None,
            target_instance_id: None,
            error: None,
        };
        self.plans.write().insert(plan.id, plan.clone());

        info!(
            plan_id = %plan.id,
            instance_id = %source_instance_id,
            from = %source.provider_type,
            to = %target_provider_type,
            steps = plan.steps.len(),
            "Created migration plan"
        );
        Ok(plan)
    }

    /// Run a pending plan to completion, failure or cancellation.
    ///
    /// A failed step is reported through `MigrationResult::success`, not as
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::PlanNotFound` or `ControlError::InvalidPlanState`
    /// if the plan is not pending.
    pub async fn start_migration(&self, plan_id: &PlanId) -> Result<MigrationResult> {
        self.update_plan(plan_id, |plan| {
            if plan.status != MigrationStatus::Pending {
                return Err(ControlError::InvalidPlanState {
                    plan_id: plan.id,
                    status: plan.status,
                });
            }
            plan.status = MigrationStatus::Running;
            Ok(())
        })?;
        info!(plan_id = %plan_id, "Starting migration");

        // A plan that turns terminal mid-step is frozen; a target created by
        // that step is reported through the result only.
        let mut created_target = None;
        loop {
            let plan = self.plan(plan_id)?;
            if plan.status != MigrationStatus::Running {
                info!(
                    plan_id = %plan_id,
                    status = %plan.status,
                    target_instance_id = ?created_target,
                    "Migration stopped advancing"
                );
                return Ok(self.result(plan, created_target));
            }
            let Some(step) = plan.steps.get(plan.current_step_index) else {
                let plan = self.update_plan(plan_id, |plan| {
                    if plan.status == MigrationStatus::Running {
                        plan.status = MigrationStatus::Completed;
                    }
                    Ok(())
                })?;
                info!(plan_id = %plan_id, status = %plan.status, "Migration finished");
                return Ok(self.result(plan, created_target));
            };
            let kind = step.kind;
            let index = plan.current_step_index;

            let remaining = (plan.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.update_plan(plan_id, |plan| {
                if plan.status != MigrationStatus::Running {
                    return Ok(());
                }
                plan.steps[index].status = StepStatus::Running;
                plan.steps[index].started_at = Some(Utc::now());
                Ok(())
            })?;

            let outcome = if remaining.is_zero() {
                Err(ControlError::Internal("migration plan expired".into()))
            } else {
                match tokio::time::timeout(remaining, self.run_step(kind, &plan)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ControlError::Internal("migration plan expired".into())),
                }
            };

            match outcome {
                Ok(effect) => {
                    if let StepEffect::Created(id) = &effect {
                        created_target = Some(*id);
                    }
                    self.update_plan(plan_id, |plan| {
                        if plan.status.is_terminal() {
                            return Ok(());
                        }
                        let step = &mut plan.steps[index];
                        step.status = StepStatus::Completed;
                        step.completed_at = Some(Utc::now());
                        match effect {
                            StepEffect::None => {}
                            StepEffect::Translated(config) => plan.target_config = Some(config),
                            StepEffect::Created(id) => plan.target_instance_id = Some(id),
                        }
                        plan.current_step_index = index + 1;
                        Ok(())
                    })?;
                }
                Err(e) => {
                    let message = format!("step {kind} failed: {e}");
                    warn!(plan_id = %plan_id, step = %kind, error = %e, "Migration step failed");
                    let plan = self.update_plan(plan_id, |plan| {
                        if plan.status.is_terminal() {
                            return Ok(());
                        }
                        let step = &mut plan.steps[index];
                        step.status = StepStatus::Failed;
                        step.completed_at = Some(Utc::now());
                        step.error = Some(e.to_string());
                        plan.status = MigrationStatus::Failed;
                        plan.error = Some(message);
                        Ok(())
                    })?;
                    return Ok(self.result(plan, created_target));
                }
            }
        }
    }

    async fn run_step(&self, kind: StepKind, plan: &MigrationPlan) -> Result<StepEffect> {
        let source_id = &plan.source_instance_id;
        match kind {
            StepKind::StopSource => {
                self.fleet.stop_instance(source_id).await?;
                Ok(StepEffect::None)
            }
            StepKind::TranslateConfig => {
                let source = self
                    .fleet
                    .registry()
                    .get_instance(source_id)
                    .ok_or(ControlError::InstanceNotFound(*source_id))?;
                let target = self.fleet.provider(plan.target_provider_type)?;
                let config = source.config;
                target.validate_instance_config(&config)?;
                Ok(StepEffect::Translated(config))
            }
            StepKind::CreateTarget => {
                let config = plan.target_config.as_ref().ok_or_else(|| {
                    ControlError::Internal("no translated config for target".into())
                })?;
                let created = self
                    .fleet
                    .create_instance(config, Some(plan.target_provider_type))
                    .await?;
                Ok(StepEffect::Created(created.id))
            }
            StepKind::StartTarget => {
                let target_id = plan
                    .target_instance_id
                    .ok_or_else(|| ControlError::Internal("no target instance".into()))?;
                let refreshed = self.fleet.get_instance(&target_id).await?;
                if refreshed.is_some_and(|t| t.status == InstanceStatus::Running) {
                    return Ok(StepEffect::None);
                }
                self.fleet.start_instance(&target_id).await?;
                Ok(StepEffect::None)
            }
            StepKind::DeleteSource => {
                self.fleet.delete_instance(source_id).await?;
                Ok(StepEffect::None)
            }
        }
    }

    /// Cancel a pending or running plan.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::PlanNotFound`, or `ControlError::InvalidPlanState`
    /// if the plan already finished.
    pub fn cancel_migration(&self, plan_id: &PlanId) -> Result<MigrationPlan> {
        let plan = self.update_plan(plan_id, |plan| {
            if plan.status.is_terminal() {
                return Err(ControlError::InvalidPlanState {
                    plan_id: plan.id,
                    status: plan.status,
                });
            }
            plan.status = MigrationStatus::Cancelled;
            Ok(())
        })?;
        info!(plan_id = %plan_id, "Cancelled migration");
        Ok(plan)
    }

    /// A plan by id.
    #[must_use]
    pub fn get_migration_plan(&self, plan_id: &PlanId) -> Option<MigrationPlan> {
        self.plans.read().get(plan_id).cloned()
    }

    /// All plans, oldest first.
    #[must_use]
    pub fn list_migration_plans(&self) -> Vec<MigrationPlan> {
        let mut plans: Vec<_> = self.plans.read().values().cloned().collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Cancel every unfinished plan and refuse new ones. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut cancelled = 0usize;
        for plan in self.plans.write().values_mut() {
            if !plan.status.is_terminal() {
                plan.status = MigrationStatus::Cancelled;
                plan.error = Some("controller disposed".to_string());
                cancelled += 1;
            }
        }
        info!(cancelled, "Migration manager disposed");
    }

    fn plan(&self, plan_id: &PlanId) -> Result<MigrationPlan> {
        self.get_migration_plan(plan_id)
            .ok_or(ControlError::PlanNotFound(*plan_id))
    }

    fn update_plan<F>(&self, plan_id: &PlanId, f: F) -> Result<MigrationPlan>
    where
        F: FnOnce(&mut MigrationPlan) -> Result<()>,
    {
        let mut plans = self.plans.write();
        let plan = plans
            .get_mut(plan_id)
            .ok_or(ControlError::PlanNotFound(*plan_id))?;
        f(plan)?;
        Ok(plan.clone())
    }

    fn result(&self, plan: MigrationPlan, created_target: Option<InstanceId>) -> MigrationResult {
        let target_instance = plan
            .target_instance_id
            .or(created_target)
            .and_then(|id| self.fleet.registry().get_instance(&id));
        MigrationResult {
            success: plan.status == MigrationStatus::Completed,
            plan,
            target_instance,
        }
    }
}

enum StepEffect {
    None,
    Translated(InstanceConfig),
    Created(InstanceId),
}
