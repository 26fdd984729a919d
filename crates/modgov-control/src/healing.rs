// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Automatic remediation of unhealthy modules.
//!
//! Health checks and anomalies both end up as [`HealthIssue`]s. Each issue
//! maps to one [`HealingActionType`], which is carried out through an
//! [`ActionExecutor`] and appended to the module's bounded history. Failures
//! are recorded on the action and logged; they never propagate.

use crate::anomaly::{Anomaly, AnomalyType};
use crate::balancer::BalancerCommand;
use crate::health::{HealthEvaluator, HealthIssue, HealthIssueType, HealthState, ModuleHealthStatus};
use crate::load::LoadTracker;
use crate::optimization::ModelStore;
use crate::ring::RingBuffer;
use anyhow::{anyhow, Context as _};
use crossbeam_channel::Sender;
use modgov_core::config::describe;
use modgov_core::event::Listeners;
use modgov_core::{Clock, ConfigStore, ModuleId, ModuleRegistry, ModuleStats};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Remediation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealingActionType {
    /// Reset the module's internal state.
    ResetModule,
    /// Unload and reload the module.
    RestartModule,
    /// Drop the module's caches.
    ClearCaches,
    /// Apply the recommended configuration for the current load.
    OptimizeConfiguration,
    /// Shrink the module's thread budget.
    ThrottleResources,
    /// Nothing to do but record the issue.
    LogOnly,
}

impl HealingActionType {
    /// The remediation for an issue.
    pub fn for_issue(issue_type: HealthIssueType) -> Self {
        match issue_type {
            HealthIssueType::HighErrorRate | HealthIssueType::HighWarningRate => {
                HealingActionType::ResetModule
            }
            HealthIssueType::SlowResponse => HealingActionType::OptimizeConfiguration,
            HealthIssueType::HighCpuUsage => HealingActionType::ThrottleResources,
            HealthIssueType::HighMemoryUsage => HealingActionType::ClearCaches,
            HealthIssueType::Deadlock => HealingActionType::RestartModule,
            HealthIssueType::Unknown => HealingActionType::LogOnly,
        }
    }
}

impl fmt::Display for HealingActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealingActionType::ResetModule => "RESET_MODULE",
            HealingActionType::RestartModule => "RESTART_MODULE",
            HealingActionType::ClearCaches => "CLEAR_CACHES",
            HealingActionType::OptimizeConfiguration => "OPTIMIZE_CONFIGURATION",
            HealingActionType::ThrottleResources => "THROTTLE_RESOURCES",
            HealingActionType::LogOnly => "LOG_ONLY",
        };
        f.write_str(label)
    }
}

/// A remediation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct HealingAction {
    /// Unique id.
    pub id: Uuid,
    /// Target module.
    pub module_id: ModuleId,
    /// What was done.
    pub action_type: HealingActionType,
    /// Human-readable summary.
    pub description: String,
    /// The issue that triggered it.
    pub related_issue: HealthIssueType,
    /// `true` once the executor succeeded.
    pub executed: bool,
    /// When execution finished.
    #[serde(skip)]
    pub executed_at: Option<Instant>,
    /// Executor failure, if any.
    pub error: Option<String>,
}

/// Carries out healing actions.
pub trait ActionExecutor: Send + Sync {
    /// Executes `action` on `module` in response to `issue`.
    fn execute(
        &self,
        module: &ModuleId,
        action: HealingActionType,
        issue: &HealthIssue,
    ) -> anyhow::Result<()>;
}

/// Executor backed by the module registry, the config store, the trained
/// optimization models and the balancer's command queue.
pub struct RegistryActionExecutor {
    registry: Arc<dyn ModuleRegistry>,
    config_store: Arc<dyn ConfigStore>,
    models: Arc<ModelStore>,
    load: Arc<LoadTracker>,
    balancer: Sender<BalancerCommand>,
}

impl RegistryActionExecutor {
    /// Wires the executor to its collaborators.
    pub fn new(
        registry: Arc<dyn ModuleRegistry>,
        config_store: Arc<dyn ConfigStore>,
        models: Arc<ModelStore>,
        load: Arc<LoadTracker>,
        balancer: Sender<BalancerCommand>,
    ) -> Self {
        Self {
            registry,
            config_store,
            models,
            load,
            balancer,
        }
    }

    fn optimize(&self, module: &ModuleId) -> anyhow::Result<()> {
        let current = self
            .config_store
            .current_config(module)
            .with_context(|| format!("reading configuration of '{module}'"))?;
        let diff = self
            .models
            .optimized_config(module, &current, self.load.get())
            .ok_or_else(|| anyhow!("no trained optimization model for '{module}'"))?;
        if diff.is_empty() {
            log::info!("SelfHealing: configuration of '{module}' already optimal.");
            return Ok(());
        }
        self.config_store
            .apply(module, &diff)
            .with_context(|| format!("applying {} to '{module}'", describe(&diff)))
    }
}

impl ActionExecutor for RegistryActionExecutor {
    fn execute(
        &self,
        module: &ModuleId,
        action: HealingActionType,
        issue: &HealthIssue,
    ) -> anyhow::Result<()> {
        match action {
            HealingActionType::ResetModule => self.registry.reset_module(module),
            HealingActionType::RestartModule => self.registry.restart_module(module),
            HealingActionType::ClearCaches => self.registry.clear_caches(module),
            HealingActionType::OptimizeConfiguration => self.optimize(module),
            HealingActionType::ThrottleResources => self
                .balancer
                .send(BalancerCommand::Throttle {
                    module: module.clone(),
                })
                .map_err(|_| anyhow!("balancer command queue is closed")),
            HealingActionType::LogOnly => {
                log::info!("SelfHealing: '{module}': {} logged only.", issue.description);
                Ok(())
            }
        }
    }
}

/// Runs health checks and remediation for every module.
pub struct SelfHealingManager {
    clock: Arc<dyn Clock>,
    evaluator: HealthEvaluator,
    executor: Arc<dyn ActionExecutor>,
    history_capacity: usize,
    cooldown: Duration,
    statuses: RwLock<HashMap<ModuleId, ModuleHealthStatus>>,
    history: RwLock<HashMap<ModuleId, Arc<Mutex<RingBuffer<HealingAction>>>>>,
    listeners: Listeners<HealingAction>,
}

impl SelfHealingManager {
    /// Creates a manager keeping `history_capacity` actions per module.
    /// A non-zero `cooldown` suppresses repeating an action type on a module.
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        history_capacity: usize,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clock,
            evaluator: HealthEvaluator,
            executor,
            history_capacity,
            cooldown,
            statuses: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            listeners: Listeners::new("SelfHealing"),
        }
    }

    /// Registers a callback invoked synchronously for every action.
    pub fn on_healing_action<F>(&self, callback: F)
    where
        F: Fn(&HealingAction) + Send + Sync + 'static,
    {
        self.listeners.add(callback);
    }

    /// Evaluates `stats`, stores the resulting status and remediates every issue.
    pub fn check_module(&self, module: &ModuleId, stats: &ModuleStats) -> ModuleHealthStatus {
        let now = self.clock.now();
        let issues = self.evaluator.evaluate(stats, now);
        let status = ModuleHealthStatus {
            module_id: module.clone(),
            state: if issues.is_empty() {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            issues,
            checked_at: Some(now),
        };

        let previous = self
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.clone(), status.clone());
        if previous.map(|p| p.state) != Some(status.state) {
            log::info!("SelfHealing: '{module}' is now {:?}.", status.state);
        }

        for issue in &status.issues {
            self.remediate(module, issue);
        }
        status
    }

    /// Remediates an anomaly as if a health check had found it.
    pub fn handle_anomaly(&self, anomaly: &Anomaly) -> Option<HealingAction> {
        let issue_type = match anomaly.anomaly_type {
            AnomalyType::ResponseTimeSpike => HealthIssueType::SlowResponse,
            AnomalyType::MemoryLeak => HealthIssueType::HighMemoryUsage,
            AnomalyType::CpuSpike | AnomalyType::PerformanceDegradation => HealthIssueType::Unknown,
        };
        let issue = HealthIssue {
            issue_type,
            description: anomaly.description.clone(),
            severity: anomaly.severity,
            detected_at: anomaly.timestamp,
        };
        self.remediate(&anomaly.module_id, &issue)
    }

    /// Executes the action mapped to `issue`. Returns `None` when the
    /// cooldown suppressed it.
    pub fn remediate(&self, module: &ModuleId, issue: &HealthIssue) -> Option<HealingAction> {
        let action_type = HealingActionType::for_issue(issue.issue_type);
        let history = self.history_for(module);

        if self.in_cooldown(&history, action_type) {
            log::debug!("SelfHealing: {action_type} on '{module}' suppressed by cooldown.");
            return None;
        }

        let mut action = HealingAction {
            id: Uuid::new_v4(),
            module_id: module.clone(),
            action_type,
            description: format!("{action_type} for {}: {}", issue.issue_type, issue.description),
            related_issue: issue.issue_type,
            executed: false,
            executed_at: None,
            error: None,
        };

        match self.executor.execute(module, action_type, issue) {
            Ok(()) => {
                action.executed = true;
                log::info!("SelfHealing: '{module}': {}", action.description);
            }
            Err(e) => {
                action.error = Some(format!("{e:#}"));
                log::warn!("SelfHealing: {action_type} on '{module}' failed: {e:#}");
            }
        }
        action.executed_at = Some(self.clock.now());

        history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action.clone());
        self.listeners.notify(&action);
        Some(action)
    }

    fn in_cooldown(
        &self,
        history: &Mutex<RingBuffer<HealingAction>>,
        action_type: HealingActionType,
    ) -> bool {
        if self.cooldown.is_zero() {
            return false;
        }
        let now = self.clock.now();
        history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .filter(|a| a.action_type == action_type)
            .filter_map(|a| a.executed_at)
            .any(|at| now.saturating_duration_since(at) < self.cooldown)
    }

    fn history_for(&self, module: &ModuleId) -> Arc<Mutex<RingBuffer<HealingAction>>> {
        if let Some(existing) = self
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
        {
            return Arc::clone(existing);
        }
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            history
                .entry(module.clone())
                .or_insert_with(|| Arc::new(Mutex::new(RingBuffer::new(self.history_capacity)))),
        )
    }

    /// Forgets the status and history of modules not in `registered`.
    pub fn retain_modules(&self, registered: &HashSet<ModuleId>) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| registered.contains(id));
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| registered.contains(id));
    }

    /// Last status of `module`; `Unknown` if it was never checked.
    pub fn health_status(&self, module: &ModuleId) -> ModuleHealthStatus {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
            .unwrap_or_else(|| ModuleHealthStatus::unknown(module.clone()))
    }

    /// Last status of every checked module, sorted by module.
    pub fn all_health_statuses(&self) -> Vec<ModuleHealthStatus> {
        let mut statuses: Vec<_> = self
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        statuses.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        statuses
    }

    /// Retained actions of `module`, oldest first.
    pub fn healing_history(&self, module: &ModuleId) -> Vec<HealingAction> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .map(|h| {
                h.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for SelfHealingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfHealingManager")
            .field("history_capacity", &self.history_capacity)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::severity::Severity;
    use modgov_core::ManualClock;

    /// Records every call and fails on demand.
    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(ModuleId, HealingActionType)>>,
        fail_on: Option<HealingActionType>,
    }

    impl ActionExecutor for RecordingExecutor {
        fn execute(
            &self,
            module: &ModuleId,
            action: HealingActionType,
            _issue: &HealthIssue,
        ) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((module.clone(), action));
            if self.fail_on == Some(action) {
                anyhow::bail!("{action} unsupported");
            }
            Ok(())
        }
    }

    fn manager(
        executor: Arc<RecordingExecutor>,
        cooldown: Duration,
    ) -> (SelfHealingManager, ManualClock) {
        let clock = ManualClock::new();
        (
            SelfHealingManager::new(executor, 500, cooldown, Arc::new(clock.clone())),
            clock,
        )
    }

    fn anomaly(module: &str, anomaly_type: AnomalyType) -> Anomaly {
        Anomaly {
            id: Uuid::new_v4(),
            metric_name: "module.response.time".into(),
            anomaly_type,
            severity: Severity::High,
            description: "spike".into(),
            module_id: ModuleId::from(module),
            details: Default::default(),
            timestamp: Instant::now(),
        }
    }

    // --- Mapping ---

    #[test]
    fn test_issue_to_action_mapping() {
        use HealingActionType as A;
        use HealthIssueType as I;
        assert_eq!(A::for_issue(I::HighErrorRate), A::ResetModule);
        assert_eq!(A::for_issue(I::HighWarningRate), A::ResetModule);
        assert_eq!(A::for_issue(I::SlowResponse), A::OptimizeConfiguration);
        assert_eq!(A::for_issue(I::HighCpuUsage), A::ThrottleResources);
        assert_eq!(A::for_issue(I::HighMemoryUsage), A::ClearCaches);
        assert_eq!(A::for_issue(I::Deadlock), A::RestartModule);
        assert_eq!(A::for_issue(I::Unknown), A::LogOnly);
    }

    // --- Health checks ---

    #[test]
    fn test_unchecked_module_is_unknown() {
        let (manager, _) = manager(Arc::default(), Duration::ZERO);
        assert_eq!(
            manager.health_status(&ModuleId::from("ghost")).state,
            HealthState::Unknown
        );
        assert!(manager.all_health_statuses().is_empty());
    }

    #[test]
    fn test_unhealthy_module_is_remediated() {
        let executor = Arc::new(RecordingExecutor::default());
        let (manager, _) = manager(Arc::clone(&executor), Duration::ZERO);
        let id = ModuleId::from("db");
        let stats = ModuleStats {
            error_count: 2,
            cpu_fraction: 0.95,
            ..Default::default()
        };

        let status = manager.check_module(&id, &stats);

        assert_eq!(status.state, HealthState::Unhealthy);
        assert_eq!(status.issues.len(), 2);
        assert_eq!(
            *executor.calls.lock().unwrap(),
            vec![
                (id.clone(), HealingActionType::ResetModule),
                (id.clone(), HealingActionType::ThrottleResources),
            ]
        );
        let history = manager.healing_history(&id);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|a| a.executed && a.error.is_none()));
    }

    #[test]
    fn test_healthy_module_takes_no_action() {
        let executor = Arc::new(RecordingExecutor::default());
        let (manager, _) = manager(Arc::clone(&executor), Duration::ZERO);
        let id = ModuleId::from("ui");

        assert!(manager.check_module(&id, &ModuleStats::default()).is_healthy());
        assert!(executor.calls.lock().unwrap().is_empty());
        assert_eq!(manager.all_health_statuses().len(), 1);
    }

    #[test]
    fn test_executor_failure_is_recorded() {
        let executor = Arc::new(RecordingExecutor {
            fail_on: Some(HealingActionType::ClearCaches),
            ..Default::default()
        });
        let (manager, _) = manager(executor, Duration::ZERO);
        let id = ModuleId::from("cache");
        let stats = ModuleStats {
            memory_bytes: 512 * 1024 * 1024,
            ..Default::default()
        };

        manager.check_module(&id, &stats);

        let history = manager.healing_history(&id);
        assert_eq!(history.len(), 1);
        assert!(!history[0].executed);
        assert!(history[0].error.as_deref().unwrap().contains("unsupported"));
    }

    // --- Anomalies ---

    #[test]
    fn test_anomaly_routing() {
        let executor = Arc::new(RecordingExecutor::default());
        let (manager, _) = manager(Arc::clone(&executor), Duration::ZERO);

        let slow = manager
            .handle_anomaly(&anomaly("a", AnomalyType::ResponseTimeSpike))
            .unwrap();
        let leak = manager
            .handle_anomaly(&anomaly("a", AnomalyType::MemoryLeak))
            .unwrap();
        let cpu = manager
            .handle_anomaly(&anomaly("a", AnomalyType::CpuSpike))
            .unwrap();

        assert_eq!(slow.action_type, HealingActionType::OptimizeConfiguration);
        assert_eq!(leak.action_type, HealingActionType::ClearCaches);
        assert_eq!(cpu.action_type, HealingActionType::LogOnly);
        assert_eq!(cpu.related_issue, HealthIssueType::Unknown);
    }

    // --- Cooldown and history ---

    #[test]
    fn test_no_cooldown_by_default() {
        let executor = Arc::new(RecordingExecutor::default());
        let (manager, _) = manager(Arc::clone(&executor), Duration::ZERO);
        let stats = ModuleStats {
            error_count: 1,
            ..Default::default()
        };
        let id = ModuleId::from("db");
        manager.check_module(&id, &stats);
        manager.check_module(&id, &stats);
        assert_eq!(manager.healing_history(&id).len(), 2);
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let executor = Arc::new(RecordingExecutor::default());
        let (manager, clock) = manager(Arc::clone(&executor), Duration::from_secs(300));
        let stats = ModuleStats {
            error_count: 1,
            ..Default::default()
        };
        let id = ModuleId::from("db");

        manager.check_module(&id, &stats);
        clock.advance(Duration::from_secs(60));
        manager.check_module(&id, &stats);
        assert_eq!(manager.healing_history(&id).len(), 1);

        clock.advance(Duration::from_secs(300));
        manager.check_module(&id, &stats);
        assert_eq!(manager.healing_history(&id).len(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let executor = Arc::new(RecordingExecutor::default());
        let clock = ManualClock::new();
        let manager = SelfHealingManager::new(executor, 3, Duration::ZERO, Arc::new(clock));
        let id = ModuleId::from("db");
        for _ in 0..10 {
            manager.handle_anomaly(&anomaly("db", AnomalyType::CpuSpike));
        }
        assert_eq!(manager.healing_history(&id).len(), 3);
    }

    #[test]
    fn test_unregistered_modules_are_forgotten() {
        let (manager, _) = manager(Arc::default(), Duration::ZERO);
        let failing = ModuleStats {
            error_count: 2,
            ..Default::default()
        };
        manager.check_module(&ModuleId::from("db"), &failing);
        manager.check_module(&ModuleId::from("gone"), &failing);

        let registered: HashSet<ModuleId> = [ModuleId::from("db")].into_iter().collect();
        manager.retain_modules(&registered);

        assert_eq!(manager.all_health_statuses().len(), 1);
        assert_eq!(manager.healing_history(&ModuleId::from("db")).len(), 1);
        assert!(manager.healing_history(&ModuleId::from("gone")).is_empty());
        assert_eq!(
            manager.health_status(&ModuleId::from("gone")).state,
            HealthState::Unknown
        );
    }

    #[test]
    fn test_listeners_see_actions() {
        let (manager, _) = manager(Arc::default(), Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        manager.on_healing_action(move |a| seen_clone.lock().unwrap().push(a.action_type));

        manager.handle_anomaly(&anomaly("a", AnomalyType::MemoryLeak));
        assert_eq!(*seen.lock().unwrap(), vec![HealingActionType::ClearCaches]);
    }
}
