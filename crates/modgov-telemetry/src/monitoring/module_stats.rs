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

//! Accumulates what modules report about themselves.

use modgov_core::{ModuleId, ModuleStats};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Debug, Default)]
struct MethodTotals {
    calls: u64,
    total_ms: f64,
}

#[derive(Debug, Default)]
struct ModuleCounters {
    methods: BTreeMap<String, MethodTotals>,
    errors: u64,
    warnings: u64,
    cpu_fraction: f64,
    memory_bytes: u64,
}

/// Thread-safe recorder of per-module calls, errors, warnings and resource usage.
///
/// Totals are cumulative until [`ModuleStatsRecorder::reset`] is called for a
/// module, which is what a module reset does.
#[derive(Debug, Default)]
pub struct ModuleStatsRecorder {
    modules: RwLock<HashMap<ModuleId, Arc<Mutex<ModuleCounters>>>>,
}

impl ModuleStatsRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call of `method` that took `millis`.
    pub fn record_call(&self, module: &ModuleId, method: &str, millis: f64) {
        let counters = self.counters(module);
        let mut counters = counters.lock().unwrap_or_else(PoisonError::into_inner);
        let totals = counters.methods.entry(method.to_owned()).or_default();
        totals.calls += 1;
        totals.total_ms += millis.max(0.0);
    }

    /// Records an error raised by the module.
    pub fn record_error(&self, module: &ModuleId) {
        self.counters(module)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .errors += 1;
    }

    /// Records a warning raised by the module.
    pub fn record_warning(&self, module: &ModuleId) {
        self.counters(module)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .warnings += 1;
    }

    /// Sets the resources currently attributed to the module.
    pub fn set_resource_usage(&self, module: &ModuleId, cpu_fraction: f64, memory_bytes: u64) {
        let counters = self.counters(module);
        let mut counters = counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.cpu_fraction = cpu_fraction.clamp(0.0, 1.0);
        counters.memory_bytes = memory_bytes;
    }

    /// Forgets everything recorded for the module.
    pub fn reset(&self, module: &ModuleId) {
        if let Some(counters) = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
        {
            *counters.lock().unwrap_or_else(PoisonError::into_inner) = ModuleCounters::default();
        }
    }

    /// Current statistics of the module. Unknown modules report zeros.
    pub fn stats(&self, module: &ModuleId) -> ModuleStats {
        let Some(counters) = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
        else {
            return ModuleStats::default();
        };
        let counters = counters.lock().unwrap_or_else(PoisonError::into_inner);

        let (calls, total_ms) = counters
            .methods
            .values()
            .fold((0u64, 0.0f64), |(c, t), m| (c + m.calls, t + m.total_ms));
        let method_times = counters
            .methods
            .iter()
            .filter(|(_, m)| m.calls > 0)
            .map(|(name, m)| (name.clone(), m.total_ms / m.calls as f64))
            .collect();

        ModuleStats {
            avg_response_time_ms: if calls == 0 { 0.0 } else { total_ms / calls as f64 },
            cpu_fraction: counters.cpu_fraction,
            memory_bytes: counters.memory_bytes,
            error_count: counters.errors,
            warning_count: counters.warnings,
            method_times,
        }
    }

    fn counters(&self, module: &ModuleId) -> Arc<Mutex<ModuleCounters>> {
        if let Some(existing) = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
        {
            return Arc::clone(existing);
        }
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(modules.entry(module.clone()).or_default())
    }
}
