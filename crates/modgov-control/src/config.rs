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

//! Governor configuration.

use crate::anomaly::BaselineScope;
use crate::error::{GovernorError, GovernorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration of the governor and its components.
///
/// Every field has a default, so a RON file only needs the values it changes:
///
/// ```ron
/// (
///     monitoring_interval_secs: 15,
///     enable_auto_tuning: false,
///     baseline_scope: Shared,
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernorConfig {
    /// Period of metric collection, profiling and anomaly detection.
    pub monitoring_interval_secs: u64,
    /// Period of the configuration optimization pass.
    pub optimization_interval_secs: u64,
    /// Period of optimization model training.
    pub training_interval_secs: u64,
    /// Period of thread budget rebalancing.
    pub load_balancing_interval_secs: u64,
    /// Period of module health checks.
    pub health_check_interval_secs: u64,

    /// Apply optimized configurations automatically.
    pub enable_auto_tuning: bool,
    /// Judge collected module metrics against their baselines.
    pub enable_anomaly_detection: bool,
    /// Run trend prediction after each collection.
    pub enable_predictive_scaling: bool,
    /// Rebalance thread budgets.
    pub enable_load_balancing: bool,
    /// Check health and remediate.
    pub enable_self_healing: bool,

    /// How anomaly baselines are keyed.
    pub baseline_scope: BaselineScope,
    /// Data points retained per module profile.
    pub profile_capacity: usize,
    /// Anomalies retained per baseline.
    pub anomaly_capacity: usize,
    /// Healing actions retained per module.
    pub healing_history_capacity: usize,
    /// Minimum profile size before a module's configuration is optimized.
    pub min_points_for_optimization: usize,
    /// Minimum profile size before a module's model is trained.
    pub min_points_for_training: usize,

    /// Thread budget shared by all modules. Defaults to the processor count.
    pub total_threads: Option<usize>,
    /// Suppresses repeating the same healing action on a module within this
    /// window. Zero disables the cooldown.
    pub healing_cooldown_secs: u64,

    /// Worker threads of the default scheduler.
    pub worker_threads: usize,
    /// How long `stop` waits for in-flight work.
    pub shutdown_timeout_secs: u64,
    /// Pending events kept for the event stream; older ones are discarded first.
    pub event_buffer_size: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: 60,
            optimization_interval_secs: 1800,
            training_interval_secs: 86_400,
            load_balancing_interval_secs: 30,
            health_check_interval_secs: 60,
            enable_auto_tuning: true,
            enable_anomaly_detection: true,
            enable_predictive_scaling: true,
            enable_load_balancing: true,
            enable_self_healing: true,
            baseline_scope: BaselineScope::default(),
            profile_capacity: 10_000,
            anomaly_capacity: 1000,
            healing_history_capacity: 500,
            min_points_for_optimization: 10,
            min_points_for_training: 30,
            total_threads: None,
            healing_cooldown_secs: 0,
            worker_threads: 3,
            shutdown_timeout_secs: 10,
            event_buffer_size: 1024,
        }
    }
}

impl GovernorConfig {
    /// Parses and validates a RON configuration.
    pub fn from_ron_str(source: &str) -> GovernorResult<Self> {
        let config: GovernorConfig = ron::de::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a RON configuration file.
    pub fn load(path: impl AsRef<Path>) -> GovernorResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| GovernorError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_ron_str(&source)?;
        log::info!("Config: loaded governor configuration from {}.", path.display());
        Ok(config)
    }

    /// Rejects values no component can work with.
    pub fn validate(&self) -> GovernorResult<()> {
        let intervals = [
            ("monitoring_interval_secs", self.monitoring_interval_secs),
            ("optimization_interval_secs", self.optimization_interval_secs),
            ("training_interval_secs", self.training_interval_secs),
            ("load_balancing_interval_secs", self.load_balancing_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(GovernorError::InvalidConfig(format!("{name} must be positive")));
        }

        let sizes = [
            ("profile_capacity", self.profile_capacity),
            ("anomaly_capacity", self.anomaly_capacity),
            ("healing_history_capacity", self.healing_history_capacity),
            ("worker_threads", self.worker_threads),
            ("event_buffer_size", self.event_buffer_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(GovernorError::InvalidConfig(format!("{name} must be positive")));
        }

        if self.total_threads == Some(0) {
            return Err(GovernorError::InvalidConfig(
                "total_threads must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// The thread budget, falling back to the processor count.
    pub fn effective_total_threads(&self) -> usize {
        self.total_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Shutdown timeout as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Healing cooldown as a duration.
    pub fn healing_cooldown(&self) -> Duration {
        Duration::from_secs(self.healing_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GovernorConfig::default();
        assert_eq!(config.monitoring_interval_secs, 60);
        assert_eq!(config.optimization_interval_secs, 1800);
        assert_eq!(config.training_interval_secs, 86_400);
        assert_eq!(config.load_balancing_interval_secs, 30);
        assert!(config.enable_auto_tuning && config.enable_self_healing);
        assert_eq!(config.baseline_scope, BaselineScope::PerModule);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_ron_keeps_defaults() {
        let config = GovernorConfig::from_ron_str(
            "(monitoring_interval_secs: 15, enable_auto_tuning: false, baseline_scope: Shared, total_threads: Some(8))",
        )
        .unwrap();
        assert_eq!(config.monitoring_interval_secs, 15);
        assert!(!config.enable_auto_tuning);
        assert_eq!(config.baseline_scope, BaselineScope::Shared);
        assert_eq!(config.effective_total_threads(), 8);
        assert_eq!(config.health_check_interval_secs, 60);
    }

    #[test]
    fn test_malformed_ron_is_a_parse_error() {
        let err = GovernorConfig::from_ron_str("(monitoring_interval_secs: \"soon\")").unwrap_err();
        assert!(matches!(err, GovernorError::ConfigParse(_)));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let err = GovernorConfig::from_ron_str("(health_check_interval_secs: 0)").unwrap_err();
        assert!(matches!(err, GovernorError::InvalidConfig(msg) if msg.contains("health_check")));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = GovernorConfig::load("/definitely/not/here.ron").unwrap_err();
        assert!(matches!(err, GovernorError::ConfigIo { .. }));
    }
}
