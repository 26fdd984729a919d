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

//! `sysinfo`-backed implementation of the [`MetricSource`] contract.

use super::module_stats::ModuleStatsRecorder;
use modgov_core::{MetricSource, ModuleId, ModuleStats, ServerSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Samples the host with `sysinfo` and reads module statistics from a
/// shared [`ModuleStatsRecorder`].
///
/// The external load proxy and tick rate are host concepts `sysinfo` knows
/// nothing about; the host pushes them with [`SysinfoMetricSource::set_host_load`].
pub struct SysinfoMetricSource {
    system: Arc<Mutex<System>>,
    pid: Option<Pid>,
    recorder: Arc<ModuleStatsRecorder>,
    external_load: AtomicU64,
    tick_rate: AtomicU64,
}

impl SysinfoMetricSource {
    /// Creates a new source reading module statistics from `recorder`.
    pub fn new(recorder: Arc<ModuleStatsRecorder>) -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Sysinfo: cannot resolve the current pid ({e}), thread count disabled.");
                None
            }
        };
        Self {
            system: Arc::new(Mutex::new(system)),
            pid,
            recorder,
            external_load: AtomicU64::new(0.0f64.to_bits()),
            tick_rate: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    /// The recorder module statistics are read from.
    pub fn recorder(&self) -> &Arc<ModuleStatsRecorder> {
        &self.recorder
    }

    /// Publishes the host-specific load indicators used in the next snapshot.
    pub fn set_host_load(&self, external_load_proxy: f64, tick_rate: f64) {
        self.external_load
            .store(external_load_proxy.to_bits(), Ordering::Relaxed);
        self.tick_rate.store(tick_rate.to_bits(), Ordering::Relaxed);
    }
}

impl MetricSource for SysinfoMetricSource {
    fn snapshot(&self) -> anyhow::Result<ServerSnapshot> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_all();
        system.refresh_memory();

        let thread_count = match self.pid {
            Some(pid) => {
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    false,
                    ProcessRefreshKind::nothing().with_tasks(),
                );
                system
                    .process(pid)
                    .and_then(|process| process.tasks())
                    .map(|tasks| tasks.len())
                    .unwrap_or(0)
            }
            None => 0,
        };

        let snapshot = ServerSnapshot {
            cpu_load: f64::from(system.global_cpu_usage() / 100.0).clamp(0.0, 1.0),
            used_memory: system.used_memory(),
            max_memory: system.total_memory(),
            thread_count,
            external_load_proxy: f64::from_bits(self.external_load.load(Ordering::Relaxed)),
            tick_rate: f64::from_bits(self.tick_rate.load(Ordering::Relaxed)),
            timestamp: Instant::now(),
        };
        log::trace!(
            "Sysinfo: cpu={:.2} mem={}/{} threads={}",
            snapshot.cpu_load,
            snapshot.used_memory,
            snapshot.max_memory,
            snapshot.thread_count
        );
        Ok(snapshot)
    }

    fn module_stats(&self, module: &ModuleId) -> anyhow::Result<ModuleStats> {
        Ok(self.recorder.stats(module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_within_bounds() {
        let source = SysinfoMetricSource::new(Arc::new(ModuleStatsRecorder::new()));
        source.set_host_load(12.0, 19.5);

        let snapshot = source.snapshot().unwrap();
        assert!((0.0..=1.0).contains(&snapshot.cpu_load));
        assert!(snapshot.used_memory <= snapshot.max_memory);
        assert_eq!(snapshot.external_load_proxy, 12.0);
        assert_eq!(snapshot.tick_rate, 19.5);
    }

    #[test]
    fn test_module_stats_come_from_recorder() {
        let recorder = Arc::new(ModuleStatsRecorder::new());
        let id = ModuleId::from("db");
        recorder.record_error(&id);

        let source = SysinfoMetricSource::new(Arc::clone(&recorder));
        assert_eq!(source.module_stats(&id).unwrap().error_count, 1);
    }
}
