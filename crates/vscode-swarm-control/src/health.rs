//! Health polling and recovery escalation.
//!
//! Each tick checks every `Running` or `Creating` instance through its
//! provider, records the observation and, once an instance has been
//! unhealthy for `unhealthy_threshold` consecutive ticks, runs the recovery
//! ladder. An instance that exhausts `max_recovery_attempts` is marked
//! failed, flagged for attention and left alone afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vscode_swarm_core::InstanceId;
use vscode_swarm_store::{InstanceStatus, VSCodeInstance};

use crate::config::{HealthMonitorConfig, RecoveryActionsConfig};
use crate::error::{ControlError, Result};
use crate::fleet::Fleet;
use crate::lifecycle::is_monitored;
use crate::migration::{MigrationManager, MigrationOptions};

/// Classification of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The check succeeded.
    Healthy,
    /// The check failed on a running instance, or the provider errored.
    Unhealthy,
    /// No conclusion: still creating, timed out, or provider inactive.
    Unknown,
}

/// One entry of an instance's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthObservation {
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Classification.
    pub status: HealthStatus,
    /// Explanation for non-healthy results.
    pub details: Option<String>,
}

/// Current and historical health of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// The instance.
    pub instance_id: InstanceId,
    /// Latest classification.
    pub status: HealthStatus,
    /// Time of the latest check.
    pub last_checked: DateTime<Utc>,
    /// Explanation of the latest classification.
    pub details: Option<String>,
    /// Unhealthy observations since the last healthy one.
    pub consecutive_failures: u32,
    /// Recovery attempts made so far.
    pub recovery_attempts: u32,
    /// Recovery gave up; an operator must step in.
    pub needs_attention: bool,
    /// Bounded history, oldest first.
    pub history: VecDeque<HealthObservation>,
}

impl HealthRecord {
    fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            status: HealthStatus::Unknown,
            last_checked: Utc::now(),
            details: None,
            consecutive_failures: 0,
            recovery_attempts: 0,
            needs_attention: false,
            history: VecDeque::new(),
        }
    }

    fn observe(&mut self, observation: HealthObservation, history_size: usize) {
        match observation.status {
            HealthStatus::Healthy => {
                self.consecutive_failures = 0;
                self.recovery_attempts = 0;
            }
            HealthStatus::Unhealthy => self.consecutive_failures += 1,
            HealthStatus::Unknown => {}
        }
        self.status = observation.status;
        self.last_checked = observation.timestamp;
        self.details.clone_from(&observation.details);

        self.history.push_back(observation);
        while self.history.len() > history_size.max(1) {
            self.history.pop_front();
        }
    }
}

/// A recovery action, tried in ladder order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Stop and start through the owning provider.
    Restart,
    /// Replace with a new instance on the same provider.
    Recreate,
    /// Move to another active provider.
    Migrate,
}

impl RecoveryStrategy {
    /// The enabled actions in escalation order.
    #[must_use]
    pub fn ladder(actions: &RecoveryActionsConfig) -> Vec<Self> {
        [
            (actions.restart, Self::Restart),
            (actions.recreate, Self::Recreate),
            (actions.migrate, Self::Migrate),
        ]
        .into_iter()
        .filter_map(|(enabled, strategy)| enabled.then_some(strategy))
        .collect()
    }
}

/// What a call to `recover_instance` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOutcome {
    /// The instance recovery ran for.
    pub instance_id: InstanceId,
    /// Attempt number, 0 if no attempt was made.
    pub attempt: u32,
    /// The action that succeeded.
    pub strategy: Option<RecoveryStrategy>,
    /// Whether an action succeeded.
    pub success: bool,
    /// Replacement id when recreate or migrate succeeded.
    pub replacement_id: Option<InstanceId>,
    /// Errors of the failed actions, in ladder order.
    pub errors: Vec<String>,
    /// The attempt cap was reached and the instance marked failed.
    pub gave_up: bool,
}

impl RecoveryOutcome {
    const fn skipped(instance_id: InstanceId, gave_up: bool) -> Self {
        Self {
            instance_id,
            attempt: 0,
            strategy: None,
            success: false,
            replacement_id: None,
            errors: Vec::new(),
            gave_up,
        }
    }
}

struct RecoveryGuard<'a> {
    set: &'a Mutex<HashSet<InstanceId>>,
    instance_id: InstanceId,
}

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.instance_id);
    }
}

/// Periodic health checks with automatic recovery.
pub struct HealthMonitor {
    fleet: Arc<Fleet>,
    migration: Option<Arc<MigrationManager>>,
    config: HealthMonitorConfig,
    records: RwLock<HashMap<InstanceId, HealthRecord>>,
    recovering: Mutex<HashSet<InstanceId>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(
        fleet: Arc<Fleet>,
        migration: Option<Arc<MigrationManager>>,
        config: HealthMonitorConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            fleet,
            migration,
            config,
            records: RwLock::new(HashMap::new()),
            recovering: Mutex::new(HashSet::new()),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Spawn the polling loop. A second call does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || *self.shutdown.borrow() {
            return;
        }

        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_millis(self.config.check_interval_ms.max(1));

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = monitor.config.check_interval_ms, "Health monitor started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => {
                        debug!("Health monitor received shutdown signal");
                        break;
                    }
                }
                // A tick can wait on slow backends; shutdown drops it mid-flight
                tokio::select! {
                    _ = monitor.check_all() => {}
                    _ = shutdown.changed() => {
                        debug!("Health monitor interrupted during a tick");
                        break;
                    }
                }
            }
        }));
    }

    /// Whether the polling loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Run one tick: check every monitored instance concurrently, then
    /// recover those over the threshold.
    pub async fn check_all(&self) -> Vec<HealthRecord> {
        let instances: Vec<VSCodeInstance> = self
            .fleet
            .registry()
            .list_instances()
            .into_iter()
            .filter(|i| is_monitored(i.status))
            .collect();
        self.prune();

        let records = join_all(instances.iter().map(|i| self.check_instance(i))).await;

        if self.config.auto_recover {
            let due: Vec<InstanceId> = records
                .iter()
                .filter(|r| {
                    !r.needs_attention
                        && r.status == HealthStatus::Unhealthy
                        && r.consecutive_failures >= self.config.unhealthy_threshold.max(1)
                })
                .map(|r| r.instance_id)
                .collect();

            let outcomes = join_all(due.iter().map(|id| self.recover_instance(id))).await;
            for (id, outcome) in due.iter().zip(outcomes) {
                if let Err(e) = outcome {
                    error!(instance_id = %id, error = %e, "Recovery failed");
                }
            }
        }

        records
    }

    /// Check one instance and record the result.
    pub async fn check_instance(&self, instance: &VSCodeInstance) -> HealthRecord {
        let (status, details) = self.classify(instance).await;
        if status != HealthStatus::Healthy {
            debug!(instance_id = %instance.id, status = ?status, details = ?details, "Health check");
        }

        let observation = HealthObservation {
            timestamp: Utc::now(),
            status,
            details,
        };
        let mut records = self.records.write();
        let record = records
            .entry(instance.id)
            .or_insert_with(|| HealthRecord::new(instance.id));
        record.observe(observation, self.config.history_size);
        record.clone()
    }

    async fn classify(&self, instance: &VSCodeInstance) -> (HealthStatus, Option<String>) {
        let Ok(provider) = self.fleet.provider(instance.provider_type) else {
            return (
                HealthStatus::Unknown,
                Some(format!("provider {} is not active", instance.provider_type)),
            );
        };

        match self
            .fleet
            .call_provider(
                "check_instance_health",
                provider.check_instance_health(&instance.id),
            )
            .await
        {
            Ok(true) => (HealthStatus::Healthy, None),
            Ok(false) if instance.status == InstanceStatus::Creating => (
                HealthStatus::Unknown,
                Some("instance is still creating".to_string()),
            ),
            Ok(false) => (
                HealthStatus::Unhealthy,
                Some("health check failed".to_string()),
            ),
            Err(e @ ControlError::Timeout { .. }) => (HealthStatus::Unknown, Some(e.to_string())),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        }
    }

    fn prune(&self) {
        let registry = self.fleet.registry();
        self.records
            .write()
            .retain(|id, _| registry.get_instance(id).is_some());
    }

    /// Run one recovery attempt through the ladder.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound` for unknown ids, or
    /// `ControlError::Internal` if a recovery of the same instance is already
    /// in progress.
    pub async fn recover_instance(&self, instance_id: &InstanceId) -> Result<RecoveryOutcome> {
        let Some(instance) = self.fleet.registry().get_instance(instance_id) else {
            return Err(ControlError::InstanceNotFound(*instance_id));
        };
        if !is_monitored(instance.status) {
            debug!(
                instance_id = %instance_id,
                status = %instance.status,
                "Instance is not running, skipping recovery"
            );
            let gave_up = self
                .records
                .read()
                .get(instance_id)
                .is_some_and(|r| r.needs_attention);
            return Ok(RecoveryOutcome::skipped(*instance_id, gave_up));
        }
        if !self.recovering.lock().insert(*instance_id) {
            return Err(ControlError::Internal(format!(
                "recovery of {instance_id} is already in progress"
            )));
        }
        let _guard = RecoveryGuard {
            set: &self.recovering,
            instance_id: *instance_id,
        };

        let max_attempts = self.config.max_recovery_attempts;
        let attempt = {
            let mut records = self.records.write();
            let record = records
                .entry(*instance_id)
                .or_insert_with(|| HealthRecord::new(*instance_id));
            if record.needs_attention {
                return Ok(RecoveryOutcome::skipped(*instance_id, true));
            }
            if record.recovery_attempts >= max_attempts {
                None
            } else {
                record.recovery_attempts += 1;
                Some(record.recovery_attempts)
            }
        };
        let Some(attempt) = attempt else {
            let gave_up = self.give_up(instance_id, "recovery attempts exhausted").await;
            return Ok(RecoveryOutcome::skipped(*instance_id, gave_up));
        };

        info!(instance_id = %instance_id, attempt, max_attempts, "Attempting recovery");

        let mut errors = Vec::new();
        for strategy in RecoveryStrategy::ladder(&self.config.recovery_actions) {
            match self.run_strategy(strategy, instance_id).await {
                Ok(replacement_id) => {
                    info!(
                        instance_id = %instance_id,
                        strategy = ?strategy,
                        attempt,
                        "Recovery succeeded"
                    );
                    self.after_success(instance_id, replacement_id);
                    return Ok(RecoveryOutcome {
                        instance_id: *instance_id,
                        attempt,
                        strategy: Some(strategy),
                        success: true,
                        replacement_id,
                        errors,
                        gave_up: false,
                    });
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance_id,
                        strategy = ?strategy,
                        error = %e,
                        "Recovery action failed"
                    );
                    errors.push(format!("{strategy:?}: {e}"));
                    if !self.still_monitored(instance_id) {
                        info!(
                            instance_id = %instance_id,
                            "Instance left monitored state, abandoning recovery"
                        );
                        break;
                    }
                }
            }
        }

        let gave_up = attempt >= max_attempts
            && self
                .give_up(instance_id, &format!("recovery failed after {attempt} attempts"))
                .await;

        Ok(RecoveryOutcome {
            instance_id: *instance_id,
            attempt,
            strategy: None,
            success: false,
            replacement_id: None,
            errors,
            gave_up,
        })
    }

    async fn run_strategy(
        &self,
        strategy: RecoveryStrategy,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceId>> {
        match strategy {
            RecoveryStrategy::Restart => {
                self.fleet.restart_instance(instance_id).await?;
                Ok(None)
            }
            RecoveryStrategy::Recreate => {
                let replacement = self.fleet.recreate_instance(instance_id).await?;
                Ok(Some(replacement.id))
            }
            RecoveryStrategy::Migrate => {
                let migration = self
                    .migration
                    .as_ref()
                    .ok_or_else(|| ControlError::Config("migration is not available".into()))?;
                let source = self
                    .fleet
                    .registry()
                    .get_instance(instance_id)
                    .ok_or(ControlError::InstanceNotFound(*instance_id))?;
                if !is_monitored(source.status) {
                    return Err(ControlError::InvalidState {
                        instance_id: *instance_id,
                        from: source.status,
                        to: InstanceStatus::Running,
                    });
                }
                let target = self
                    .fleet
                    .active_provider_types()
                    .into_iter()
                    .find(|t| *t != source.provider_type)
                    .ok_or_else(|| {
                        ControlError::Config("no other active provider to migrate to".into())
                    })?;

                let plan = migration.create_migration_plan(
                    instance_id,
                    target,
                    &MigrationOptions::default(),
                )?;
                let result = migration.start_migration(&plan.id).await?;
                if result.success {
                    Ok(result.plan.target_instance_id)
                } else {
                    Err(ControlError::Internal(
                        result
                            .plan
                            .error
                            .unwrap_or_else(|| format!("migration {}", result.plan.status)),
                    ))
                }
            }
        }
    }

    fn after_success(&self, instance_id: &InstanceId, replacement_id: Option<InstanceId>) {
        let mut records = self.records.write();
        match replacement_id {
            Some(new_id) if new_id != *instance_id => {
                records.remove(instance_id);
                records.insert(new_id, HealthRecord::new(new_id));
            }
            _ => {
                if let Some(record) = records.get_mut(instance_id) {
                    record.consecutive_failures = 0;
                }
            }
        }
    }

    fn still_monitored(&self, instance_id: &InstanceId) -> bool {
        self.fleet
            .registry()
            .get_instance(instance_id)
            .is_some_and(|i| is_monitored(i.status))
    }

    /// Mark the instance failed and flag its record. Returns whether the
    /// instance was marked; a stopped or deleted instance is left alone.
    async fn give_up(&self, instance_id: &InstanceId, reason: &str) -> bool {
        match self.fleet.mark_failed(instance_id, reason).await {
            Ok(Some(_)) => {
                if let Some(record) = self.records.write().get_mut(instance_id) {
                    record.needs_attention = true;
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Failed to mark instance failed");
                false
            }
        }
    }

    /// Health record of an instance.
    #[must_use]
    pub fn get_health(&self, instance_id: &InstanceId) -> Option<HealthRecord> {
        self.records.read().get(instance_id).cloned()
    }

    /// All health records.
    #[must_use]
    pub fn list_health(&self) -> Vec<HealthRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.instance_id);
        records
    }

    /// Stop the polling loop and wait for it. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Internal` if the loop task panicked.
    pub async fn dispose(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| ControlError::Internal(format!("health monitor task failed: {e}")))?;
            info!("Health monitor stopped");
        }
        Ok(())
    }
}
