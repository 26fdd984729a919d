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

//! Host load classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// CPU load below which the host is considered lightly loaded.
pub const LOW_LOAD_THRESHOLD: f64 = 0.3;
/// CPU load below which the host is considered moderately loaded.
pub const MEDIUM_LOAD_THRESHOLD: f64 = 0.7;

/// Coarse host load bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LoadLevel {
    /// `cpu < 0.3`.
    Low,
    /// `0.3 <= cpu < 0.7`.
    Medium,
    /// `cpu >= 0.7`.
    High,
}

impl LoadLevel {
    /// All levels, from lowest to highest.
    pub const ALL: [LoadLevel; 3] = [LoadLevel::Low, LoadLevel::Medium, LoadLevel::High];

    /// Classifies a CPU load. NaN counts as idle and values outside `[0, 1]`
    /// are clamped, so every input maps to exactly one level.
    pub fn from_cpu_load(cpu_load: f64) -> Self {
        if cpu_load.is_nan() {
            return LoadLevel::Low;
        }
        let cpu_load = cpu_load.clamp(0.0, 1.0);
        if cpu_load < LOW_LOAD_THRESHOLD {
            LoadLevel::Low
        } else if cpu_load < MEDIUM_LOAD_THRESHOLD {
            LoadLevel::Medium
        } else {
            LoadLevel::High
        }
    }

    /// Position in [`LoadLevel::ALL`].
    pub fn index(self) -> usize {
        match self {
            LoadLevel::Low => 0,
            LoadLevel::Medium => 1,
            LoadLevel::High => 2,
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoadLevel::Low => "LOW",
            LoadLevel::Medium => "MEDIUM",
            LoadLevel::High => "HIGH",
        };
        f.write_str(label)
    }
}

/// Last observed host CPU load, shared between the collection cycle and
/// remediation.
#[derive(Debug, Default)]
pub struct LoadTracker(AtomicU64);

impl LoadTracker {
    /// Creates a tracker reporting an idle host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the latest CPU load.
    pub fn set(&self, cpu_load: f64) {
        self.0.store(cpu_load.to_bits(), Ordering::Relaxed);
    }

    /// The latest CPU load.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// The latest load level.
    pub fn level(&self) -> LoadLevel {
        LoadLevel::from_cpu_load(self.get())
    }
}
