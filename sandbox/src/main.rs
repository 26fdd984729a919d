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

// Modgov Sandbox
// Runs a few simulated modules under the governor and prints what it saw.
//
// Usage: sandbox [governor.ron]
// MODGOV_SANDBOX_SECS sets the run length (default 20).

use anyhow::{Context, Result};
use modgov_control::{
    Collaborators, Governor, GovernorConfig, GovernorEvent, LifecycleOp, StaticModuleRegistry,
};
use modgov_core::config::InMemoryConfigStore;
use modgov_core::{
    ConfigStore, ConfigValue, MetricSource, ModuleCategory, ModuleId, ModuleRegistry,
};
use modgov_telemetry::{logging, ModuleStatsRecorder, SysinfoMetricSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A module the sandbox pretends to host.
struct SimulatedModule {
    id: &'static str,
    category: ModuleCategory,
    /// Base duration of one call.
    base_ms: u64,
    cpu_fraction: f64,
    memory_bytes: u64,
    /// Every n-th call fails.
    error_every: Option<u64>,
}

const MODULES: &[SimulatedModule] = &[
    SimulatedModule {
        id: "economy",
        category: ModuleCategory::Database,
        base_ms: 4,
        cpu_fraction: 0.15,
        memory_bytes: 48 * 1024 * 1024,
        error_every: Some(97),
    },
    SimulatedModule {
        id: "nightly-backup",
        category: ModuleCategory::Backup,
        base_ms: 25,
        cpu_fraction: 0.35,
        memory_bytes: 160 * 1024 * 1024,
        error_every: None,
    },
    SimulatedModule {
        id: "hud",
        category: ModuleCategory::Ui,
        base_ms: 2,
        cpu_fraction: 0.05,
        memory_bytes: 8 * 1024 * 1024,
        error_every: None,
    },
];

fn sandbox_config() -> Result<GovernorConfig> {
    match std::env::args().nth(1) {
        Some(path) => GovernorConfig::load(&path).with_context(|| format!("loading {path}")),
        None => Ok(GovernorConfig {
            monitoring_interval_secs: 1,
            load_balancing_interval_secs: 2,
            health_check_interval_secs: 3,
            optimization_interval_secs: 8,
            training_interval_secs: 6,
            min_points_for_optimization: 5,
            min_points_for_training: 5,
            healing_cooldown_secs: 5,
            ..Default::default()
        }),
    }
}

fn run_duration() -> Duration {
    let secs = std::env::var("MODGOV_SANDBOX_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);
    Duration::from_secs(secs)
}

/// Drives one module: acquire a slot, "work", record the call.
fn drive(
    module: &'static SimulatedModule,
    governor: Arc<Governor>,
    recorder: Arc<ModuleStatsRecorder>,
    stop: Arc<AtomicBool>,
) {
    let id = ModuleId::from(module.id);
    let started = Instant::now();
    let mut calls: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        let Some(_permit) = governor.acquire(&id) else {
            thread::sleep(Duration::from_millis(5));
            continue;
        };
        calls += 1;

        // The economy module degrades sharply halfway through the run.
        let slowdown = if module.id == "economy" && started.elapsed() > Duration::from_secs(10) {
            40
        } else {
            1
        };
        let jitter = calls % 3;
        let work = Duration::from_millis(module.base_ms * slowdown + jitter);
        thread::sleep(work);

        recorder.record_call(&id, "handle", work.as_secs_f64() * 1000.0);
        recorder.set_resource_usage(&id, module.cpu_fraction, module.memory_bytes);
        if module.error_every.is_some_and(|n| calls % n == 0) {
            recorder.record_error(&id);
        }
    }
    log::debug!("Sandbox: '{id}' made {calls} calls.");
}

fn main() -> Result<()> {
    logging::init();

    let config = sandbox_config()?;
    let recorder = Arc::new(ModuleStatsRecorder::new());
    let source = Arc::new(SysinfoMetricSource::new(Arc::clone(&recorder)));
    source.set_host_load(0.0, 20.0);

    let hook_recorder = Arc::clone(&recorder);
    let registry = Arc::new(StaticModuleRegistry::new().with_lifecycle_hook(move |id, op| {
        log::info!("Sandbox: {op:?} requested for '{id}'.");
        if matches!(op, LifecycleOp::Reset | LifecycleOp::Restart) {
            hook_recorder.reset(id);
        }
        Ok(())
    }));
    let store = Arc::new(InMemoryConfigStore::new());
    for module in MODULES {
        registry.register(module.id, module.category);
        store.insert(
            ModuleId::from(module.id),
            [
                ("cacheSize".to_owned(), ConfigValue::Int(1000)),
                ("asyncProcessing".to_owned(), ConfigValue::Bool(false)),
            ]
            .into_iter()
            .collect(),
        );
    }

    let governor = Arc::new(Governor::new(
        config,
        Collaborators::new(
            Arc::clone(&source) as Arc<dyn MetricSource>,
            Arc::clone(&registry) as Arc<dyn ModuleRegistry>,
            Arc::clone(&store) as Arc<dyn ConfigStore>,
        ),
    )?);
    let events = governor.events();
    governor.start();

    let stop = Arc::new(AtomicBool::new(false));
    let drivers: Vec<_> = MODULES
        .iter()
        .map(|module| {
            let (governor, recorder, stop) =
                (Arc::clone(&governor), Arc::clone(&recorder), Arc::clone(&stop));
            thread::spawn(move || drive(module, governor, recorder, stop))
        })
        .collect();

    let deadline = Instant::now() + run_duration();
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(GovernorEvent::Anomaly(a)) => {
                log::info!("Sandbox: anomaly [{}] {}", a.severity, a.description)
            }
            Ok(GovernorEvent::PredictedIssue(i)) => {
                log::info!("Sandbox: predicted [{}] {}", i.severity, i.title)
            }
            Ok(GovernorEvent::HealingAction(h)) => log::info!(
                "Sandbox: healing {} on '{}' executed={}",
                h.action_type,
                h.module_id,
                h.executed
            ),
            Err(_) => {}
        }
    }

    stop.store(true, Ordering::Relaxed);
    for driver in drivers {
        if driver.join().is_err() {
            log::warn!("Sandbox: a module driver panicked.");
        }
    }
    governor.stop()?;

    for module in MODULES {
        let id = ModuleId::from(module.id);
        if let Ok(summary) = governor.profile_summary(&id) {
            log::info!(
                "Sandbox: '{id}' points={} avg={:.1}ms peak={:.1}ms",
                summary.data_points,
                summary.aggregates.avg_response_time_ms,
                summary.aggregates.peak_response_time_ms
            );
        }
        if let Ok(allocation) = governor.thread_allocation(&id) {
            log::info!(
                "Sandbox: '{id}' threads={} max_tasks={} runs={}",
                allocation.allocated_threads,
                allocation.max_concurrent_tasks,
                allocation.execution_count
            );
        }
        log::info!(
            "Sandbox: '{id}' health={:?} config={:?}",
            governor.health_status(&id).state,
            store.current_config(&id)?
        );
    }
    log::info!("Sandbox: metrics {}", governor.metrics().to_json()?);
    Ok(())
}
