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

use approx::assert_relative_eq;
use modgov_control::{
    Collaborators, Governor, GovernorConfig, GovernorTask, HealingActionType, HealthState,
    LifecycleOp, ManualScheduler, Severity, StaticModuleRegistry,
};
use modgov_core::config::InMemoryConfigStore;
use modgov_core::{
    Clock, ConfigStore, ManualClock, MetricSource, ModuleCategory, ModuleId, ModuleRegistry,
    ModuleStats, ServerSnapshot, TaskScheduler,
};
use modgov_telemetry::ModuleStatsRecorder;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// --- TEST HOST ---

/// Server readings are scripted; module statistics come from a recorder.
struct ScriptedSource {
    clock: ManualClock,
    recorder: Arc<ModuleStatsRecorder>,
    cpu_load: Mutex<f64>,
    tick_rate: Mutex<f64>,
}

impl MetricSource for ScriptedSource {
    fn snapshot(&self) -> anyhow::Result<ServerSnapshot> {
        Ok(ServerSnapshot {
            cpu_load: *self.cpu_load.lock().unwrap(),
            used_memory: 2 << 30,
            max_memory: 8 << 30,
            thread_count: 24,
            external_load_proxy: 3.0,
            tick_rate: *self.tick_rate.lock().unwrap(),
            timestamp: self.clock.now(),
        })
    }

    fn module_stats(&self, module: &ModuleId) -> anyhow::Result<ModuleStats> {
        Ok(self.recorder.stats(module))
    }
}

struct Host {
    governor: Governor,
    scheduler: Arc<ManualScheduler>,
    source: Arc<ScriptedSource>,
    recorder: Arc<ModuleStatsRecorder>,
    registry: Arc<StaticModuleRegistry>,
}

fn host(config: GovernorConfig) -> Host {
    let clock = ManualClock::new();
    let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
    let recorder = Arc::new(ModuleStatsRecorder::new());
    let source = Arc::new(ScriptedSource {
        clock: clock.clone(),
        recorder: Arc::clone(&recorder),
        cpu_load: Mutex::new(0.2),
        tick_rate: Mutex::new(20.0),
    });

    let hook_recorder = Arc::clone(&recorder);
    let registry = Arc::new(StaticModuleRegistry::new().with_lifecycle_hook(move |id, op| {
        if op == LifecycleOp::Reset {
            hook_recorder.reset(id);
        }
        Ok(())
    }));

    let collaborators = Collaborators::new(
        Arc::clone(&source) as Arc<dyn MetricSource>,
        Arc::clone(&registry) as Arc<dyn ModuleRegistry>,
        Arc::new(InMemoryConfigStore::new()) as Arc<dyn ConfigStore>,
    )
    .with_scheduler(Arc::clone(&scheduler) as Arc<dyn TaskScheduler>)
    .with_clock(Arc::new(clock));

    Host {
        governor: Governor::new(config, collaborators).expect("valid configuration"),
        scheduler,
        source,
        recorder,
        registry,
    }
}

fn config() -> GovernorConfig {
    GovernorConfig {
        total_threads: Some(8),
        ..Default::default()
    }
}

fn data_points(governor: &Governor, module: &str) -> usize {
    governor
        .profile_summary(&ModuleId::from(module))
        .map(|s| s.data_points)
        .unwrap_or(0)
}

// --- LIFECYCLE ---

#[test]
fn test_stop_twice_then_restart_resumes_scheduling() {
    let h = host(config());
    h.registry.register("chat", ModuleCategory::General);
    h.recorder.record_call(&ModuleId::from("chat"), "send", 4.0);

    h.governor.start();
    h.scheduler.advance(Duration::from_secs(60));
    assert_eq!(data_points(&h.governor, "chat"), 1);

    h.governor.stop().unwrap();
    h.governor.stop().unwrap();
    h.scheduler.advance(Duration::from_secs(600));
    assert_eq!(data_points(&h.governor, "chat"), 1, "stopped governor must not collect");

    h.governor.start();
    h.scheduler.advance(Duration::from_secs(60));
    assert_eq!(data_points(&h.governor, "chat"), 2);
    assert!(h.governor.is_running());
}

#[test]
fn test_governor_with_worker_scheduler_stops_cleanly() {
    let registry = Arc::new(StaticModuleRegistry::new());
    let recorder = Arc::new(ModuleStatsRecorder::new());
    let clock = ManualClock::new();
    let source = Arc::new(ScriptedSource {
        clock,
        recorder,
        cpu_load: Mutex::new(0.5),
        tick_rate: Mutex::new(20.0),
    });
    let governor = Governor::new(
        GovernorConfig {
            monitoring_interval_secs: 1,
            ..config()
        },
        Collaborators::new(
            source as Arc<dyn MetricSource>,
            registry as Arc<dyn ModuleRegistry>,
            Arc::new(InMemoryConfigStore::new()) as Arc<dyn ConfigStore>,
        ),
    )
    .unwrap();

    governor.start();
    std::thread::sleep(Duration::from_millis(50));
    governor.stop().unwrap();
    assert!(!governor.is_running());
}

// --- SELF-HEALING ---

#[test]
fn test_erroring_module_is_reset_and_recovers() {
    let h = host(config());
    h.registry.register("economy", ModuleCategory::Database);
    let id = ModuleId::from("economy");
    h.recorder.record_call(&id, "pay", 12.0);
    h.recorder.record_error(&id);

    h.governor.run_cycle(GovernorTask::HealthCheck);
    let status = h.governor.health_status(&id);
    assert_eq!(status.state, HealthState::Unhealthy);
    assert_eq!(h.registry.lifecycle_log(), vec![(id.clone(), LifecycleOp::Reset)]);

    let history = h.governor.healing_history(&id);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action_type, HealingActionType::ResetModule);
    assert!(history[0].executed);

    // The reset cleared the recorded error.
    h.governor.run_cycle(GovernorTask::HealthCheck);
    assert!(h.governor.health_status(&id).is_healthy());
}

#[test]
fn test_healing_events_reach_listeners_and_stream() {
    let h = host(config());
    let events = h.governor.events();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    h.governor
        .on_healing_action(move |a| seen_clone.lock().unwrap().push(a.action_type));

    h.registry.register("maps", ModuleCategory::Ui);
    let id = ModuleId::from("maps");
    h.recorder.set_resource_usage(&id, 0.1, 300 * 1024 * 1024);
    h.governor.run_cycle(GovernorTask::HealthCheck);

    assert_eq!(*seen.lock().unwrap(), vec![HealingActionType::ClearCaches]);
    assert_eq!(events.try_iter().count(), 1);
    assert_eq!(
        h.registry.lifecycle_log(),
        vec![(id, LifecycleOp::ClearCaches)]
    );
}

// --- PREDICTION ---

#[test]
fn test_falling_tps_predicts_critical_degradation() {
    let h = host(config());
    h.governor.start();

    // One collection per minute, TPS falling 0.15 per minute from 19.0.
    for minute in 0..12 {
        *h.source.tick_rate.lock().unwrap() = 19.0 - 0.15 * minute as f64;
        h.scheduler.advance(Duration::from_secs(60));
    }

    let issues = h.governor.recent_predicted_issues(Duration::from_secs(3600));
    let tps: Vec<_> = issues
        .iter()
        .filter(|i| i.title == "Server TPS degradation predicted")
        .collect();
    assert_eq!(tps.len(), 1, "TPS issue must be reported once");
    assert_eq!(tps[0].severity, Severity::Critical);
    assert_relative_eq!(
        tps[0].lead_time().as_secs_f64() / 60.0,
        50.0,
        epsilon = 1e-6
    );
}

#[test]
fn test_prediction_disabled_reports_nothing() {
    let h = host(GovernorConfig {
        enable_predictive_scaling: false,
        ..config()
    });
    for minute in 0..15 {
        *h.source.tick_rate.lock().unwrap() = 19.0 - 0.15 * minute as f64;
        h.governor.run_cycle(GovernorTask::Collection);
        h.scheduler.advance(Duration::from_secs(60));
    }
    assert!(h
        .governor
        .recent_predicted_issues(Duration::from_secs(3600))
        .is_empty());
}

// --- LOAD BALANCING ---

#[test]
fn test_balancing_weights_categories() {
    let h = host(config());
    h.registry.register("db", ModuleCategory::Database);
    h.registry.register("backup", ModuleCategory::Backup);
    for module in ["db", "backup"] {
        let id = ModuleId::from(module);
        h.recorder.record_call(&id, "run", 10.0);
        h.recorder.set_resource_usage(&id, 0.2, 1024);
    }
    h.governor.run_cycle(GovernorTask::Collection);
    h.governor.run_cycle(GovernorTask::LoadBalancing);

    let db = h.governor.thread_allocation(&ModuleId::from("db")).unwrap();
    let backup = h.governor.thread_allocation(&ModuleId::from("backup")).unwrap();
    // Scores 1.5 : 0.8 over 8 threads.
    assert_eq!(db.allocated_threads, 5);
    assert_eq!(backup.allocated_threads, 3);
    assert_eq!(db.max_concurrent_tasks, 10);
    assert_eq!(backup.max_concurrent_tasks, 6);
}
