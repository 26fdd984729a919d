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

//! The governor: wires every component to the host's collaborators and
//! drives them on a schedule.
//!
//! While running, five periodic cycles share one [`TaskScheduler`]:
//!
//! | cycle | default period | work |
//! |---|---|---|
//! | collection | 60 s | server metrics, profiles, anomaly detection, prediction |
//! | optimization | 30 min | configuration diffs for modules with enough data |
//! | training | 24 h | retrain optimization models |
//! | load balancing | 30 s | redistribute the thread budget |
//! | health check | 60 s | evaluate health and remediate |
//!
//! Every cycle first runs one full period after [`Governor::start`]. Per
//! module failures are logged with the module id and never abort a cycle.

use crate::anomaly::{Anomaly, AnomalyDetector};
use crate::balancer::{AdmissionPermit, AllocationSnapshot, BalanceInput, LoadBalancer};
use crate::config::GovernorConfig;
use crate::error::{GovernorError, GovernorResult};
use crate::healing::{HealingAction, RegistryActionExecutor, SelfHealingManager};
use crate::health::ModuleHealthStatus;
use crate::load::{LoadLevel, LoadTracker};
use crate::optimization::ModelStore;
use crate::prediction::{names, PerformancePredictor, PredictedIssue};
use crate::profile::{ModuleProfile, ProfileSummary};
use crate::scheduler::WorkerScheduler;
use modgov_core::config::describe;
use modgov_core::event::EventBus;
use modgov_core::{
    Clock, ConfigStore, MetricSource, ModuleDescriptor, ModuleId, ModuleRegistry, ServerSnapshot,
    SystemClock, TaskId, TaskScheduler,
};
use modgov_telemetry::MetricsRegistry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Metric names judged by the anomaly detector for every module.
pub const MODULE_RESPONSE_TIME: &str = "module.response.time";
/// See [`MODULE_RESPONSE_TIME`].
pub const MODULE_CPU: &str = "module.cpu";
/// See [`MODULE_RESPONSE_TIME`].
pub const MODULE_MEMORY: &str = "module.memory";

/// The periodic cycles run by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GovernorTask {
    /// Metric collection, profiling, anomaly detection and prediction.
    Collection,
    /// Configuration optimization.
    Optimization,
    /// Optimization model training.
    Training,
    /// Thread budget rebalancing.
    LoadBalancing,
    /// Health checks and remediation.
    HealthCheck,
}

impl GovernorTask {
    /// Every cycle, in scheduling order.
    pub const ALL: [GovernorTask; 5] = [
        GovernorTask::Collection,
        GovernorTask::Optimization,
        GovernorTask::Training,
        GovernorTask::LoadBalancing,
        GovernorTask::HealthCheck,
    ];

    /// Name used for scheduling and logs.
    pub fn name(self) -> &'static str {
        match self {
            GovernorTask::Collection => "governor.collection",
            GovernorTask::Optimization => "governor.optimization",
            GovernorTask::Training => "governor.training",
            GovernorTask::LoadBalancing => "governor.load-balancing",
            GovernorTask::HealthCheck => "governor.health-check",
        }
    }

    fn period(self, config: &GovernorConfig) -> Duration {
        let secs = match self {
            GovernorTask::Collection => config.monitoring_interval_secs,
            GovernorTask::Optimization => config.optimization_interval_secs,
            GovernorTask::Training => config.training_interval_secs,
            GovernorTask::LoadBalancing => config.load_balancing_interval_secs,
            GovernorTask::HealthCheck => config.health_check_interval_secs,
        };
        Duration::from_secs(secs)
    }

    fn enabled(self, config: &GovernorConfig) -> bool {
        match self {
            GovernorTask::LoadBalancing => config.enable_load_balancing,
            GovernorTask::HealthCheck => config.enable_self_healing,
            _ => true,
        }
    }
}

/// Notifications streamed through [`Governor::events`].
#[derive(Debug, Clone)]
pub enum GovernorEvent {
    /// An anomaly was detected.
    Anomaly(Anomaly),
    /// A new issue was predicted.
    PredictedIssue(PredictedIssue),
    /// A healing action was attempted.
    HealingAction(HealingAction),
}

/// The host services the governor depends on.
pub struct Collaborators {
    /// Server snapshots and per-module statistics.
    pub source: Arc<dyn MetricSource>,
    /// The loaded modules and their lifecycle hooks.
    pub registry: Arc<dyn ModuleRegistry>,
    /// Module configurations.
    pub config_store: Arc<dyn ConfigStore>,
    /// Drives the cycles. A [`WorkerScheduler`] is spawned when `None`.
    pub scheduler: Option<Arc<dyn TaskScheduler>>,
    /// Time source of every component.
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Collaborators using the system clock and a default scheduler.
    pub fn new(
        source: Arc<dyn MetricSource>,
        registry: Arc<dyn ModuleRegistry>,
        config_store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            source,
            registry,
            config_store,
            scheduler: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `scheduler` instead of spawning one.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Uses `clock` as the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct Inner {
    config: GovernorConfig,
    source: Arc<dyn MetricSource>,
    registry: Arc<dyn ModuleRegistry>,
    config_store: Arc<dyn ConfigStore>,
    metrics: MetricsRegistry,
    load: Arc<LoadTracker>,
    profiles: RwLock<HashMap<ModuleId, Arc<Mutex<ModuleProfile>>>>,
    detector: AnomalyDetector,
    predictor: PerformancePredictor,
    models: Arc<ModelStore>,
    balancer: LoadBalancer,
    healing: SelfHealingManager,
}

/// Adaptive performance governor for a set of extension modules.
pub struct Governor {
    inner: Arc<Inner>,
    scheduler: Arc<dyn TaskScheduler>,
    /// Scheduled cycles; `None` while stopped.
    tasks: Mutex<Option<Vec<TaskId>>>,
    events: Arc<EventBus<GovernorEvent>>,
}

impl Governor {
    /// Validates `config` and wires every component. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(config: GovernorConfig, collaborators: Collaborators) -> GovernorResult<Self> {
        config.validate()?;
        let Collaborators {
            source,
            registry,
            config_store,
            scheduler,
            clock,
        } = collaborators;

        let scheduler: Arc<dyn TaskScheduler> = match scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(WorkerScheduler::new(config.worker_threads)?),
        };

        let load = Arc::new(LoadTracker::new());
        let models = Arc::new(ModelStore::new());
        let balancer = LoadBalancer::new(config.effective_total_threads(), Arc::clone(&clock));
        let executor = Arc::new(RegistryActionExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&config_store),
            Arc::clone(&models),
            Arc::clone(&load),
            balancer.command_sender(),
        ));
        let healing = SelfHealingManager::new(
            executor,
            config.healing_history_capacity,
            config.healing_cooldown(),
            Arc::clone(&clock),
        );
        let detector = AnomalyDetector::new(
            config.baseline_scope,
            config.anomaly_capacity,
            Arc::clone(&clock),
        );
        let predictor = PerformancePredictor::new(Arc::clone(&clock));

        let events = Arc::new(EventBus::bounded(config.event_buffer_size));
        {
            let bus = Arc::clone(&events);
            detector.on_anomaly(move |a| {
                bus.publish(GovernorEvent::Anomaly(a.clone()));
            });
            let bus = Arc::clone(&events);
            predictor.on_predicted_issue(move |i| {
                bus.publish(GovernorEvent::PredictedIssue(i.clone()));
            });
            let bus = Arc::clone(&events);
            healing.on_healing_action(move |h| {
                bus.publish(GovernorEvent::HealingAction(h.clone()));
            });
        }

        log::info!(
            "Governor: created (threads={}, auto_tuning={}, self_healing={}).",
            balancer.total_threads(),
            config.enable_auto_tuning,
            config.enable_self_healing
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                registry,
                config_store,
                metrics: MetricsRegistry::new(),
                load,
                profiles: RwLock::new(HashMap::new()),
                detector,
                predictor,
                models,
                balancer,
                healing,
            }),
            scheduler,
            tasks: Mutex::new(None),
            events,
        })
    }

    // --- Lifecycle ---

    /// Schedules every enabled cycle. Does nothing when already running.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_some() {
            log::debug!("Governor: start ignored, already running.");
            return;
        }

        let config = &self.inner.config;
        let ids = GovernorTask::ALL
            .into_iter()
            .filter(|task| task.enabled(config))
            .map(|task| {
                let inner = Arc::clone(&self.inner);
                let period = task.period(config);
                self.scheduler.schedule_periodic(
                    task.name(),
                    period,
                    period,
                    Arc::new(move || inner.run(task)),
                )
            })
            .collect::<Vec<_>>();
        log::info!("Governor: started {} cycles.", ids.len());
        *tasks = Some(ids);
    }

    /// Cancels every cycle and waits for in-flight work.
    ///
    /// Does nothing when already stopped. Returns
    /// [`GovernorError::ShutdownTimedOut`] when work is still running after
    /// the configured timeout; the governor is stopped either way.
    pub fn stop(&self) -> GovernorResult<()> {
        let Some(ids) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        for id in ids {
            self.scheduler.cancel(id);
        }

        let timeout = self.inner.config.shutdown_timeout();
        if !self.scheduler.quiesce(timeout) {
            log::warn!("Governor: in-flight cycles still running after {timeout:?}.");
            return Err(GovernorError::ShutdownTimedOut(timeout));
        }
        log::info!("Governor: stopped.");
        Ok(())
    }

    /// `true` between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Runs one cycle synchronously, whether or not the governor is running.
    pub fn run_cycle(&self, task: GovernorTask) {
        self.inner.run(task);
    }

    // --- Notifications ---

    /// Registers a callback invoked for every anomaly.
    pub fn on_anomaly<F>(&self, callback: F)
    where
        F: Fn(&Anomaly) + Send + Sync + 'static,
    {
        self.inner.detector.on_anomaly(callback);
    }

    /// Registers a callback invoked for every newly predicted issue.
    pub fn on_predicted_issue<F>(&self, callback: F)
    where
        F: Fn(&PredictedIssue) + Send + Sync + 'static,
    {
        self.inner.predictor.on_predicted_issue(callback);
    }

    /// Registers a callback invoked for every healing action.
    pub fn on_healing_action<F>(&self, callback: F)
    where
        F: Fn(&HealingAction) + Send + Sync + 'static,
    {
        self.inner.healing.on_healing_action(callback);
    }

    /// A receiver on the event stream. A full buffer discards its oldest events.
    pub fn events(&self) -> flume::Receiver<GovernorEvent> {
        self.events.subscribe()
    }

    // --- Admission gate ---

    /// Admits one task of `module` if it is below its concurrency cap.
    pub fn try_admit(&self, module: &ModuleId) -> bool {
        self.inner.balancer.try_admit(module)
    }

    /// Releases a task admitted by [`try_admit`](Self::try_admit).
    pub fn release(&self, module: &ModuleId, execution_ms: f64) {
        self.inner.balancer.release(module, execution_ms);
    }

    /// Admits one task and returns a permit releasing it on drop.
    pub fn acquire(&self, module: &ModuleId) -> Option<AdmissionPermit> {
        self.inner.balancer.acquire(module)
    }

    // --- Queries ---

    /// The configuration in use.
    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    /// Server and per-module metrics recorded by the collection cycle.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    /// Load level of the last collected snapshot.
    pub fn load_level(&self) -> LoadLevel {
        self.inner.load.level()
    }

    /// Last health status of `module`.
    pub fn health_status(&self, module: &ModuleId) -> ModuleHealthStatus {
        self.inner.healing.health_status(module)
    }

    /// Last health status of every checked module.
    pub fn all_health_statuses(&self) -> Vec<ModuleHealthStatus> {
        self.inner.healing.all_health_statuses()
    }

    /// Retained healing actions of `module`, oldest first.
    pub fn healing_history(&self, module: &ModuleId) -> Vec<HealingAction> {
        self.inner.healing.healing_history(module)
    }

    /// Anomalies detected within `window`, oldest first.
    pub fn recent_anomalies(&self, window: Duration) -> Vec<Anomaly> {
        self.inner.detector.recent_anomalies(window)
    }

    /// Retained anomalies of `module`.
    pub fn anomalies_for(&self, module: &ModuleId) -> Vec<Anomaly> {
        self.inner.detector.anomalies_for(module)
    }

    /// Issues predicted within `window`.
    pub fn recent_predicted_issues(&self, window: Duration) -> Vec<PredictedIssue> {
        self.inner.predictor.recent_issues(window)
    }

    /// Thread allocation of `module`.
    pub fn thread_allocation(&self, module: &ModuleId) -> GovernorResult<AllocationSnapshot> {
        self.inner
            .balancer
            .allocation(module)
            .ok_or_else(|| GovernorError::UnknownModule(module.clone()))
    }

    /// Every thread allocation, sorted by module.
    pub fn thread_allocations(&self) -> Vec<(ModuleId, AllocationSnapshot)> {
        self.inner.balancer.allocations()
    }

    /// Profile digest of `module`.
    pub fn profile_summary(&self, module: &ModuleId) -> GovernorResult<ProfileSummary> {
        let profile = self
            .inner
            .profile(module)
            .ok_or_else(|| GovernorError::MissingProfile(module.clone()))?;
        let summary = profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary();
        Ok(summary)
    }

    /// Runs optimization for one registered module right away, bypassing the
    /// data-point gate of the periodic cycle.
    ///
    /// Returns `true` when a non-empty diff was applied, and
    /// [`GovernorError::Collaborator`] when the config store fails.
    pub fn optimize_module(&self, module: &ModuleId) -> GovernorResult<bool> {
        if !self.inner.is_registered(module) {
            return Err(GovernorError::UnknownModule(module.clone()));
        }
        self.inner.optimize_module(module, self.inner.load.get())
    }

    /// `true` once `module` has a trained optimization model.
    pub fn is_model_trained(&self, module: &ModuleId) -> bool {
        self.inner.models.is_trained(module)
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Governor: {e}");
        }
    }
}

impl fmt::Debug for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governor")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn run(&self, task: GovernorTask) {
        let started = Instant::now();
        match task {
            GovernorTask::Collection => self.collect(),
            GovernorTask::Optimization => self.optimize(),
            GovernorTask::Training => self.train(),
            GovernorTask::LoadBalancing => self.balance(),
            GovernorTask::HealthCheck => self.check_health(),
        }
        log::debug!("Governor: {} took {:?}.", task.name(), started.elapsed());
    }

    fn profile(&self, module: &ModuleId) -> Option<Arc<Mutex<ModuleProfile>>> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
    }

    fn profile_entry(&self, descriptor: &ModuleDescriptor) -> Arc<Mutex<ModuleProfile>> {
        if let Some(existing) = self.profile(&descriptor.id) {
            return existing;
        }
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(profiles.entry(descriptor.id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(ModuleProfile::new(
                descriptor.id.clone(),
                descriptor.category,
                self.config.profile_capacity,
            )))
        }))
    }

    fn is_registered(&self, module: &ModuleId) -> bool {
        self.registry.modules().iter().any(|d| &d.id == module)
    }

    /// Forgets per-module state of modules that left the registry.
    fn prune_unregistered(&self, modules: &[ModuleDescriptor]) {
        let registered: HashSet<ModuleId> = modules.iter().map(|d| d.id.clone()).collect();
        let removed = {
            let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
            let before = profiles.len();
            profiles.retain(|id, _| registered.contains(id));
            before - profiles.len()
        };
        if removed > 0 {
            log::info!("Governor: dropped {removed} profile(s) of unregistered modules.");
        }
        self.balancer.retain_modules(&registered);
        self.healing.retain_modules(&registered);
        self.detector.retain_modules(&registered);
    }

    /// Profiles of the currently registered modules.
    fn registered_profiles(&self) -> Vec<(ModuleDescriptor, Option<Arc<Mutex<ModuleProfile>>>)> {
        self.registry
            .modules()
            .into_iter()
            .map(|descriptor| {
                let profile = self.profile(&descriptor.id);
                (descriptor, profile)
            })
            .collect()
    }

    // --- Collection ---

    fn collect(&self) {
        let snapshot = match self.source.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Governor: server snapshot failed: {e:#}");
                return;
            }
        };
        self.load.set(snapshot.cpu_load);
        self.record_server_metrics(&snapshot);

        let modules = self.registry.modules();
        self.prune_unregistered(&modules);
        for descriptor in &modules {
            if let Err(e) = self.collect_module(descriptor, &snapshot) {
                log::warn!("Governor: collection failed for '{}': {e:#}", descriptor.id);
            }
        }
        log::debug!(
            "Governor: collected {} modules at {} load.",
            modules.len(),
            LoadLevel::from_cpu_load(snapshot.cpu_load)
        );

        if self.config.enable_predictive_scaling {
            self.predictor.predict(&self.metrics);
        }
    }

    fn record_server_metrics(&self, snapshot: &ServerSnapshot) {
        let gauges = [
            (names::CPU_USAGE, snapshot.cpu_load * 100.0),
            (names::MEMORY_USED, snapshot.used_memory as f64),
            (names::MEMORY_MAX, snapshot.max_memory as f64),
            (names::SERVER_TPS, snapshot.tick_rate),
            (names::SERVER_THREADS, snapshot.thread_count as f64),
        ];
        for (name, value) in gauges {
            if let Err(e) = self.metrics.set_gauge(name, value) {
                log::debug!("Governor: {name} not recorded: {e}");
            }
        }
    }

    fn collect_module(
        &self,
        descriptor: &ModuleDescriptor,
        snapshot: &ServerSnapshot,
    ) -> anyhow::Result<()> {
        let id = &descriptor.id;
        let stats = self.source.module_stats(id)?;

        {
            let profile = self.profile_entry(descriptor);
            let mut profile = profile.lock().unwrap_or_else(PoisonError::into_inner);
            profile.set_category(descriptor.category);
            profile.add_data_point(stats.clone(), snapshot.clone());
        }

        if self.config.enable_anomaly_detection {
            let observed = [
                (MODULE_RESPONSE_TIME, stats.avg_response_time_ms),
                (MODULE_CPU, stats.cpu_fraction),
                (MODULE_MEMORY, stats.memory_bytes as f64),
            ];
            for (metric, value) in observed {
                let Some(anomaly) = self.detector.detect_anomalies(metric, value, id) else {
                    continue;
                };
                if self.config.enable_self_healing {
                    self.healing.handle_anomaly(&anomaly);
                }
            }
        }

        self.metrics
            .record_timer(&format!("module.{id}.response.time"), stats.avg_response_time_ms)?;
        Ok(())
    }

    // --- Optimization and training ---

    fn optimize(&self) {
        if !self.config.enable_auto_tuning {
            return;
        }
        let load = self.load.get();
        let mut applied = 0;
        for (descriptor, profile) in self.registered_profiles() {
            let points = match &profile {
                Some(p) => p
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .data_point_count(),
                None => 0,
            };
            if points < self.config.min_points_for_optimization {
                log::trace!("Governor: '{}' has {points} points, not optimized.", descriptor.id);
                continue;
            }
            match self.optimize_module(&descriptor.id, load) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Governor: optimization failed for '{}': {e}", descriptor.id),
            }
        }
        log::info!("Governor: optimization applied {applied} configuration change(s).");
    }

    /// Returns `true` when a non-empty diff was applied.
    fn optimize_module(&self, id: &ModuleId, load: f64) -> GovernorResult<bool> {
        let current = self.config_store.current_config(id)?;
        let Some(diff) = self.models.optimized_config(id, &current, load) else {
            log::debug!("Governor: no trained model for '{id}' yet.");
            return Ok(false);
        };
        if diff.is_empty() {
            return Ok(false);
        }
        self.config_store.apply(id, &diff)?;
        log::info!("Governor: applied {} to '{id}'.", describe(&diff));
        Ok(true)
    }

    fn train(&self) {
        let mut trained = 0;
        for (descriptor, profile) in self.registered_profiles() {
            let Some(profile) = profile else { continue };
            let profile = profile.lock().unwrap_or_else(PoisonError::into_inner);
            if profile.data_point_count() < self.config.min_points_for_training {
                continue;
            }
            self.models.train(&profile);
            log::debug!(
                "Governor: trained '{}' on {} points.",
                descriptor.id,
                profile.data_point_count()
            );
            trained += 1;
        }
        log::info!("Governor: trained {trained} optimization model(s).");
    }

    // --- Balancing and health ---

    fn balance(&self) {
        if !self.config.enable_load_balancing {
            return;
        }
        let inputs: Vec<BalanceInput> = self
            .registered_profiles()
            .into_iter()
            .map(|(descriptor, profile)| {
                let aggregates = match &profile {
                    Some(p) => p.lock().unwrap_or_else(PoisonError::into_inner).aggregates(),
                    None => Default::default(),
                };
                BalanceInput {
                    module_id: descriptor.id,
                    category: descriptor.category,
                    avg_response_time_ms: aggregates.avg_response_time_ms,
                    cpu_fraction: aggregates.avg_cpu,
                }
            })
            .collect();
        self.balancer.rebalance(&inputs);
        self.balancer.process_commands();
    }

    fn check_health(&self) {
        if !self.config.enable_self_healing {
            return;
        }
        let mut unhealthy = 0;
        for descriptor in self.registry.modules() {
            match self.source.module_stats(&descriptor.id) {
                Ok(stats) => {
                    if !self.healing.check_module(&descriptor.id, &stats).is_healthy() {
                        unhealthy += 1;
                    }
                }
                Err(e) => log::warn!("Governor: health check failed for '{}': {e:#}", descriptor.id),
            }
        }
        self.balancer.process_commands();
        log::debug!("Governor: health check found {unhealthy} unhealthy module(s).");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::HealingActionType;
    use crate::health::HealthState;
    use crate::registry::StaticModuleRegistry;
    use crate::scheduler::ManualScheduler;
    use approx::assert_relative_eq;
    use modgov_core::config::InMemoryConfigStore;
    use modgov_core::{ConfigMap, ConfigValue, ManualClock, ModuleCategory, ModuleStats};

    /// Metric source whose readings the test sets directly.
    struct FakeSource {
        clock: ManualClock,
        cpu_load: Mutex<f64>,
        stats: Mutex<HashMap<ModuleId, ModuleStats>>,
    }

    impl FakeSource {
        fn set_stats(&self, module: &str, stats: ModuleStats) {
            self.stats.lock().unwrap().insert(ModuleId::from(module), stats);
        }
    }

    impl MetricSource for FakeSource {
        fn snapshot(&self) -> anyhow::Result<ServerSnapshot> {
            Ok(ServerSnapshot {
                cpu_load: *self.cpu_load.lock().unwrap(),
                used_memory: 1 << 30,
                max_memory: 4 << 30,
                thread_count: 12,
                external_load_proxy: 0.0,
                tick_rate: 20.0,
                timestamp: self.clock.now(),
            })
        }

        fn module_stats(&self, module: &ModuleId) -> anyhow::Result<ModuleStats> {
            self.stats
                .lock()
                .unwrap()
                .get(module)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no stats for '{module}'"))
        }
    }

    /// Config store whose backend is unreachable.
    struct UnavailableStore;

    impl ConfigStore for UnavailableStore {
        fn current_config(&self, module: &ModuleId) -> anyhow::Result<ConfigMap> {
            anyhow::bail!("config backend offline for '{module}'")
        }

        fn apply(&self, _module: &ModuleId, _diff: &ConfigMap) -> anyhow::Result<()> {
            anyhow::bail!("config backend offline")
        }
    }

    struct Harness {
        governor: Governor,
        scheduler: Arc<ManualScheduler>,
        source: Arc<FakeSource>,
        registry: Arc<StaticModuleRegistry>,
        store: Arc<InMemoryConfigStore>,
    }

    fn harness(config: GovernorConfig) -> Harness {
        let clock = ManualClock::new();
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let source = Arc::new(FakeSource {
            clock: clock.clone(),
            cpu_load: Mutex::new(0.2),
            stats: Mutex::new(HashMap::new()),
        });
        let registry = Arc::new(StaticModuleRegistry::new());
        let store = Arc::new(InMemoryConfigStore::new());
        let collaborators = Collaborators::new(
            Arc::clone(&source) as Arc<dyn MetricSource>,
            Arc::clone(&registry) as Arc<dyn ModuleRegistry>,
            Arc::clone(&store) as Arc<dyn ConfigStore>,
        )
        .with_scheduler(Arc::clone(&scheduler) as Arc<dyn TaskScheduler>)
        .with_clock(Arc::new(clock));
        let governor = Governor::new(config, collaborators).unwrap();
        Harness {
            governor,
            scheduler,
            source,
            registry,
            store,
        }
    }

    fn steady(response_ms: f64) -> ModuleStats {
        ModuleStats {
            avg_response_time_ms: response_ms,
            cpu_fraction: 0.1,
            memory_bytes: 16 * 1024 * 1024,
            ..Default::default()
        }
    }

    fn fixed_threads() -> GovernorConfig {
        GovernorConfig {
            total_threads: Some(8),
            ..Default::default()
        }
    }

    // --- Lifecycle ---

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let h = harness(fixed_threads());
        h.governor.start();
        h.governor.start();
        assert!(h.governor.is_running());
        assert_eq!(h.scheduler.task_count(), 5);

        h.governor.stop().unwrap();
        h.governor.stop().unwrap();
        assert!(!h.governor.is_running());
        assert_eq!(h.scheduler.task_count(), 0);

        h.governor.start();
        assert_eq!(h.scheduler.task_count(), 5);
    }

    #[test]
    fn test_disabled_cycles_are_not_scheduled() {
        let h = harness(GovernorConfig {
            enable_load_balancing: false,
            enable_self_healing: false,
            ..fixed_threads()
        });
        h.governor.start();
        assert_eq!(h.scheduler.task_count(), 3);
    }

    #[test]
    fn test_cycles_first_run_after_one_period() {
        let h = harness(fixed_threads());
        h.registry.register("db", ModuleCategory::Database);
        h.source.set_stats("db", steady(20.0));
        h.governor.start();

        h.scheduler.advance(Duration::from_secs(59));
        assert!(h.governor.profile_summary(&ModuleId::from("db")).is_err());

        h.scheduler.advance(Duration::from_secs(1));
        let summary = h.governor.profile_summary(&ModuleId::from("db")).unwrap();
        assert_eq!(summary.data_points, 1);
    }

    // --- Collection ---

    #[test]
    fn test_collection_records_server_metrics() {
        let h = harness(fixed_threads());
        *h.source.cpu_load.lock().unwrap() = 0.85;
        h.registry.register("db", ModuleCategory::Database);
        h.source.set_stats("db", steady(42.0));

        h.governor.run_cycle(GovernorTask::Collection);

        let metrics = h.governor.metrics();
        assert_relative_eq!(metrics.value(names::CPU_USAGE).unwrap(), 85.0);
        assert_eq!(metrics.value(names::SERVER_TPS).unwrap(), 20.0);
        assert_eq!(metrics.value(names::SERVER_THREADS).unwrap(), 12.0);
        assert_eq!(metrics.value("module.db.response.time").unwrap(), 42.0);
        assert_eq!(h.governor.load_level(), LoadLevel::High);
    }

    #[test]
    fn test_one_failing_module_does_not_block_others() {
        let h = harness(fixed_threads());
        h.registry.register("broken", ModuleCategory::General);
        h.registry.register("ok", ModuleCategory::General);
        h.source.set_stats("ok", steady(10.0));

        h.governor.run_cycle(GovernorTask::Collection);

        assert!(matches!(
            h.governor.profile_summary(&ModuleId::from("broken")),
            Err(GovernorError::MissingProfile(_))
        ));
        assert!(h.governor.profile_summary(&ModuleId::from("ok")).is_ok());
    }

    // --- Anomalies and healing ---

    #[test]
    fn test_response_spike_is_detected_and_healed() {
        let h = harness(fixed_threads());
        let events = h.governor.events();
        h.registry.register("db", ModuleCategory::Database);
        let id = ModuleId::from("db");

        for _ in 0..15 {
            h.source.set_stats("db", steady(20.0));
            h.governor.run_cycle(GovernorTask::Collection);
        }
        h.source.set_stats("db", steady(400.0));
        h.governor.run_cycle(GovernorTask::Collection);

        let anomalies = h.governor.anomalies_for(&id);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].metric_name, MODULE_RESPONSE_TIME);

        let history = h.governor.healing_history(&id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action_type, HealingActionType::OptimizeConfiguration);
        // No model has been trained yet.
        assert!(!history[0].executed);

        let streamed: Vec<_> = events.try_iter().collect();
        assert!(streamed.iter().any(|e| matches!(e, GovernorEvent::Anomaly(_))));
        assert!(streamed.iter().any(|e| matches!(e, GovernorEvent::HealingAction(_))));
    }

    #[test]
    fn test_anomalies_not_forwarded_without_self_healing() {
        let h = harness(GovernorConfig {
            enable_self_healing: false,
            ..fixed_threads()
        });
        h.registry.register("db", ModuleCategory::Database);
        for _ in 0..15 {
            h.source.set_stats("db", steady(20.0));
            h.governor.run_cycle(GovernorTask::Collection);
        }
        h.source.set_stats("db", steady(400.0));
        h.governor.run_cycle(GovernorTask::Collection);

        let id = ModuleId::from("db");
        assert_eq!(h.governor.anomalies_for(&id).len(), 1);
        assert!(h.governor.healing_history(&id).is_empty());
    }

    #[test]
    fn test_health_cycle_throttles_cpu_heavy_module() {
        let h = harness(fixed_threads());
        h.registry.register("a", ModuleCategory::General);
        h.registry.register("b", ModuleCategory::General);
        h.source.set_stats("a", steady(20.0));
        h.source.set_stats("b", steady(20.0));
        h.governor.run_cycle(GovernorTask::Collection);
        h.governor.run_cycle(GovernorTask::LoadBalancing);
        let before = h.governor.thread_allocation(&ModuleId::from("a")).unwrap();
        assert_eq!(before.allocated_threads, 4);

        h.source.set_stats(
            "a",
            ModuleStats {
                cpu_fraction: 0.95,
                ..steady(20.0)
            },
        );
        h.governor.run_cycle(GovernorTask::HealthCheck);

        let after = h.governor.thread_allocation(&ModuleId::from("a")).unwrap();
        assert_eq!(after.allocated_threads, 2);
        assert_eq!(after.max_concurrent_tasks, 4);
        assert_eq!(
            h.governor.health_status(&ModuleId::from("a")).state,
            HealthState::Unhealthy
        );
        assert!(h.governor.health_status(&ModuleId::from("b")).is_healthy());
    }

    // --- Optimization ---

    #[test]
    fn test_training_then_optimization_applies_diff() {
        let h = harness(fixed_threads());
        h.registry.register("nightly-backup", ModuleCategory::Backup);
        let id = ModuleId::from("nightly-backup");
        h.store.insert(
            id.clone(),
            [("cacheSize".to_owned(), ConfigValue::Int(1000))].into_iter().collect(),
        );
        h.source.set_stats("nightly-backup", steady(30.0));
        for _ in 0..30 {
            h.governor.run_cycle(GovernorTask::Collection);
        }

        h.governor.run_cycle(GovernorTask::Optimization);
        assert_eq!(h.store.current_config(&id).unwrap().len(), 1);

        h.governor.run_cycle(GovernorTask::Training);
        assert!(h.governor.is_model_trained(&id));
        h.governor.run_cycle(GovernorTask::Optimization);

        let config = h.store.current_config(&id).unwrap();
        assert_eq!(config.get("backupInterval"), Some(&ConfigValue::Int(15)));
        assert_eq!(config.get("parallelism"), Some(&ConfigValue::Int(8)));
        assert_eq!(config.get("cacheSize"), Some(&ConfigValue::Int(1000)));
    }

    #[test]
    fn test_optimization_skipped_without_auto_tuning() {
        let h = harness(GovernorConfig {
            enable_auto_tuning: false,
            ..fixed_threads()
        });
        h.registry.register("db", ModuleCategory::Database);
        h.source.set_stats("db", steady(30.0));
        for _ in 0..30 {
            h.governor.run_cycle(GovernorTask::Collection);
        }
        h.governor.run_cycle(GovernorTask::Training);
        h.governor.run_cycle(GovernorTask::Optimization);
        assert!(h
            .store
            .current_config(&ModuleId::from("db"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_on_demand_optimization() {
        let h = harness(fixed_threads());
        h.registry.register("db", ModuleCategory::Database);
        let db = ModuleId::from("db");
        assert!(!h.governor.optimize_module(&db).unwrap());
        assert!(matches!(
            h.governor.optimize_module(&ModuleId::from("ghost")),
            Err(GovernorError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_config_store_failure_is_a_collaborator_error() {
        let clock = ManualClock::new();
        let registry = Arc::new(StaticModuleRegistry::new());
        registry.register("db", ModuleCategory::Database);
        let source = Arc::new(FakeSource {
            clock: clock.clone(),
            cpu_load: Mutex::new(0.2),
            stats: Mutex::new(HashMap::new()),
        });
        let collaborators = Collaborators::new(
            source as Arc<dyn MetricSource>,
            registry as Arc<dyn ModuleRegistry>,
            Arc::new(UnavailableStore) as Arc<dyn ConfigStore>,
        )
        .with_scheduler(Arc::new(ManualScheduler::new(clock.clone())) as Arc<dyn TaskScheduler>)
        .with_clock(Arc::new(clock));
        let governor = Governor::new(fixed_threads(), collaborators).unwrap();

        let err = governor.optimize_module(&ModuleId::from("db")).unwrap_err();
        assert!(matches!(err, GovernorError::Collaborator(_)));
        assert!(err.to_string().contains("offline"));
    }

    // --- Queries ---

    #[test]
    fn test_unknown_module_queries() {
        let h = harness(fixed_threads());
        let ghost = ModuleId::from("ghost");
        assert!(matches!(
            h.governor.thread_allocation(&ghost),
            Err(GovernorError::UnknownModule(_))
        ));
        assert_eq!(h.governor.health_status(&ghost).state, HealthState::Unknown);
        assert!(h.governor.recent_anomalies(Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_collection_prunes_unregistered_modules() {
        let h = harness(fixed_threads());
        h.registry.register("db", ModuleCategory::Database);
        h.registry.register("old", ModuleCategory::General);
        h.source.set_stats("db", steady(20.0));
        h.source.set_stats(
            "old",
            ModuleStats {
                error_count: 1,
                ..steady(20.0)
            },
        );
        h.governor.run_cycle(GovernorTask::Collection);
        h.governor.run_cycle(GovernorTask::HealthCheck);
        let typo = ModuleId::from("typo");
        assert!(h.governor.try_admit(&typo));
        h.governor.release(&typo, 1.0);
        assert_eq!(h.governor.all_health_statuses().len(), 2);
        assert_eq!(h.governor.healing_history(&ModuleId::from("old")).len(), 1);

        assert!(h.registry.unregister(&ModuleId::from("old")));
        h.governor.run_cycle(GovernorTask::Collection);

        let old = ModuleId::from("old");
        assert!(h.governor.profile_summary(&old).is_err());
        assert!(h.governor.healing_history(&old).is_empty());
        assert_eq!(h.governor.all_health_statuses().len(), 1);
        assert!(matches!(
            h.governor.thread_allocation(&typo),
            Err(GovernorError::UnknownModule(_))
        ));
        assert_eq!(
            h.governor.profile_summary(&ModuleId::from("db")).unwrap().data_points,
            2
        );
    }

    #[test]
    fn test_admission_gate_through_governor() {
        let h = harness(fixed_threads());
        let id = ModuleId::from("ui");
        let permits: Vec<_> = (0..5).filter_map(|_| h.governor.acquire(&id)).collect();
        assert_eq!(permits.len(), 5);
        assert!(!h.governor.try_admit(&id));
        drop(permits);
        assert!(h.governor.try_admit(&id));
        h.governor.release(&id, 3.0);
        assert_eq!(h.governor.thread_allocation(&id).unwrap().current_tasks, 0);
    }
}
