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

//! Per-tick observations of the host and of its modules.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Immutable host-level observation taken once per collection tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSnapshot {
    /// Host CPU load in `[0, 1]`.
    pub cpu_load: f64,
    /// Used memory, in bytes.
    pub used_memory: u64,
    /// Memory limit of the process, in bytes.
    pub max_memory: u64,
    /// Live threads in the process.
    pub thread_count: usize,
    /// External load indicator (e.g. connected clients).
    pub external_load_proxy: f64,
    /// Host ticks per second.
    pub tick_rate: f64,
    /// When the observation was taken.
    pub timestamp: Instant,
}

impl ServerSnapshot {
    /// Used over max memory, 0 when the maximum is unknown.
    pub fn memory_ratio(&self) -> f64 {
        if self.max_memory == 0 {
            return 0.0;
        }
        self.used_memory as f64 / self.max_memory as f64
    }

    /// A zeroed snapshot taken at `timestamp`.
    pub fn idle(timestamp: Instant) -> Self {
        Self {
            cpu_load: 0.0,
            used_memory: 0,
            max_memory: 0,
            thread_count: 0,
            external_load_proxy: 0.0,
            tick_rate: 0.0,
            timestamp,
        }
    }
}

/// Statistics of a single module over the last collection interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleStats {
    /// Mean response time of the module's operations, in milliseconds.
    pub avg_response_time_ms: f64,
    /// Share of host CPU attributed to the module, in `[0, 1]`.
    pub cpu_fraction: f64,
    /// Memory attributed to the module, in bytes.
    pub memory_bytes: u64,
    /// Errors reported by the module.
    pub error_count: u64,
    /// Warnings reported by the module.
    pub warning_count: u64,
    /// Mean response time per named operation, in milliseconds.
    #[serde(default)]
    pub method_times: Vec<(String, f64)>,
}
