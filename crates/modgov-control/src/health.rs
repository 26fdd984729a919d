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

//! Health rules over module statistics.

use crate::severity::Severity;
use modgov_core::{ModuleId, ModuleStats};
use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// Warnings above this count mark a module unhealthy.
const WARNING_THRESHOLD: u64 = 5;
/// Mean response time (ms) above which a module is slow.
const SLOW_RESPONSE_MS: f64 = 500.0;
/// Mean response time (ms) above which slowness is severe.
const VERY_SLOW_RESPONSE_MS: f64 = 1000.0;
/// CPU fraction above which a module is too hungry.
const CPU_THRESHOLD: f64 = 0.8;
/// Memory above which a module is too hungry (100 MiB).
const MEMORY_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Kind of health problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealthIssueType {
    /// The module reported errors.
    HighErrorRate,
    /// The module reported many warnings.
    HighWarningRate,
    /// The module answers slowly.
    SlowResponse,
    /// The module uses too much CPU.
    HighCpuUsage,
    /// The module uses too much memory.
    HighMemoryUsage,
    /// The module stopped making progress.
    Deadlock,
    /// Anything else.
    Unknown,
}

impl fmt::Display for HealthIssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthIssueType::HighErrorRate => "HIGH_ERROR_RATE",
            HealthIssueType::HighWarningRate => "HIGH_WARNING_RATE",
            HealthIssueType::SlowResponse => "SLOW_RESPONSE",
            HealthIssueType::HighCpuUsage => "HIGH_CPU_USAGE",
            HealthIssueType::HighMemoryUsage => "HIGH_MEMORY_USAGE",
            HealthIssueType::Deadlock => "DEADLOCK",
            HealthIssueType::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// One detected problem.
#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    /// Kind of problem.
    pub issue_type: HealthIssueType,
    /// Human-readable explanation.
    pub description: String,
    /// Urgency.
    pub severity: Severity,
    /// When it was detected.
    #[serde(skip)]
    pub detected_at: Instant,
}

/// Overall health of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
    /// No issue at the last check.
    Healthy,
    /// At least one issue at the last check.
    Unhealthy,
    /// Never checked.
    Unknown,
}

/// Result of the last health check of a module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleHealthStatus {
    /// The module.
    pub module_id: ModuleId,
    /// Overall state.
    pub state: HealthState,
    /// Issues found at the last check.
    pub issues: Vec<HealthIssue>,
    /// When the last check ran, `None` if never.
    #[serde(skip)]
    pub checked_at: Option<Instant>,
}

impl ModuleHealthStatus {
    /// Status of a module that was never checked.
    pub fn unknown(module_id: ModuleId) -> Self {
        Self {
            module_id,
            state: HealthState::Unknown,
            issues: Vec::new(),
            checked_at: None,
        }
    }

    /// `true` when the last check found no issue.
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

/// Applies the health rules. Every rule is independent, so one module can
/// have several issues at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthEvaluator;

impl HealthEvaluator {
    /// Evaluates `stats`, stamping issues with `now`.
    pub fn evaluate(&self, stats: &ModuleStats, now: Instant) -> Vec<HealthIssue> {
        let mut issues = Vec::new();
        let mut push = |issue_type, severity, description: String| {
            issues.push(HealthIssue {
                issue_type,
                description,
                severity,
                detected_at: now,
            })
        };

        if stats.error_count > 0 {
            push(
                HealthIssueType::HighErrorRate,
                Severity::High,
                format!("{} errors reported", stats.error_count),
            );
        }
        if stats.warning_count > WARNING_THRESHOLD {
            push(
                HealthIssueType::HighWarningRate,
                Severity::Medium,
                format!("{} warnings reported", stats.warning_count),
            );
        }
        if stats.avg_response_time_ms > SLOW_RESPONSE_MS {
            let severity = if stats.avg_response_time_ms > VERY_SLOW_RESPONSE_MS {
                Severity::High
            } else {
                Severity::Medium
            };
            push(
                HealthIssueType::SlowResponse,
                severity,
                format!("mean response time {:.1} ms", stats.avg_response_time_ms),
            );
        }
        if stats.cpu_fraction > CPU_THRESHOLD {
            push(
                HealthIssueType::HighCpuUsage,
                Severity::High,
                format!("CPU usage {:.1}%", stats.cpu_fraction * 100.0),
            );
        }
        if stats.memory_bytes > MEMORY_THRESHOLD_BYTES {
            push(
                HealthIssueType::HighMemoryUsage,
                Severity::Medium,
                format!("memory usage {:.1} MiB", stats.memory_bytes as f64 / (1024.0 * 1024.0)),
            );
        }
        issues
    }
}
