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

//! Statistical anomaly detection against rolling baselines.
//!
//! Every observed value first joins its baseline; the value is then judged
//! against the updated mean and population standard deviation. A value more
//! than two standard deviations away from the mean is anomalous, provided the
//! baseline holds at least ten values.

use crate::ring::RingBuffer;
use crate::severity::Severity;
use modgov_core::event::Listeners;
use modgov_core::{Clock, ModuleId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Values retained per baseline.
pub const BASELINE_WINDOW: usize = 100;
/// Values a baseline needs before it judges anything.
pub const MIN_BASELINE_SAMPLES: usize = 10;
/// Distance from the mean, in standard deviations, that counts as anomalous.
pub const ANOMALY_SIGMA: f64 = 2.0;

/// How baselines are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BaselineScope {
    /// One baseline per module and metric.
    #[default]
    PerModule,
    /// One baseline per metric name, shared by all modules.
    Shared,
}

/// Kind of anomaly, derived from the metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyType {
    /// A response or timing metric jumped.
    ResponseTimeSpike,
    /// A memory metric jumped.
    MemoryLeak,
    /// A CPU metric jumped.
    CpuSpike,
    /// Any other metric.
    PerformanceDegradation,
}

impl AnomalyType {
    /// Classifies a metric by name.
    pub fn classify(metric_name: &str) -> Self {
        let name = metric_name.to_ascii_lowercase();
        if name.contains("response") || name.contains("time") {
            AnomalyType::ResponseTimeSpike
        } else if name.contains("memory") {
            AnomalyType::MemoryLeak
        } else if name.contains("cpu") {
            AnomalyType::CpuSpike
        } else {
            AnomalyType::PerformanceDegradation
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AnomalyType::ResponseTimeSpike => "Response time spike",
            AnomalyType::MemoryLeak => "Memory leak",
            AnomalyType::CpuSpike => "CPU spike",
            AnomalyType::PerformanceDegradation => "Performance degradation",
        };
        f.write_str(label)
    }
}

/// Rolling mean and population standard deviation of one series.
#[derive(Debug, Clone)]
pub struct MetricBaseline {
    values: RingBuffer<f64>,
    mean: f64,
    stddev: f64,
}

impl MetricBaseline {
    /// Creates an empty baseline.
    pub fn new() -> Self {
        Self {
            values: RingBuffer::new(BASELINE_WINDOW),
            mean: 0.0,
            stddev: 0.0,
        }
    }

    /// Adds a value and recomputes the statistics.
    pub fn add(&mut self, value: f64) {
        self.values.push(value);
        self.mean = self.values.average();
        self.stddev = self.values.stddev();
    }

    /// Current mean.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Current population standard deviation.
    pub fn stddev(&self) -> f64 {
        self.stddev
    }

    /// Retained values.
    pub fn sample_count(&self) -> usize {
        self.values.len()
    }

    /// `true` if `value` lies outside the anomaly band.
    pub fn is_anomalous(&self, value: f64) -> bool {
        self.sample_count() >= MIN_BASELINE_SAMPLES
            && (value - self.mean).abs() > ANOMALY_SIGMA * self.stddev
    }
}

impl Default for MetricBaseline {
    fn default() -> Self {
        Self::new()
    }
}

/// A detected anomaly.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    /// Unique id.
    pub id: Uuid,
    /// The observed metric.
    pub metric_name: String,
    /// Kind of anomaly.
    pub anomaly_type: AnomalyType,
    /// `High` above the mean, `Medium` below.
    pub severity: Severity,
    /// Human-readable summary.
    pub description: String,
    /// The module the value came from.
    pub module_id: ModuleId,
    /// `current_value` and `baseline` (mean), plus `stddev`.
    pub details: BTreeMap<String, f64>,
    /// When it was detected.
    #[serde(skip)]
    pub timestamp: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BaselineKey {
    module: Option<ModuleId>,
    metric: String,
}

#[derive(Debug)]
struct Series {
    baseline: MetricBaseline,
    anomalies: RingBuffer<Anomaly>,
}

/// Detects statistical anomalies on named metrics.
pub struct AnomalyDetector {
    scope: BaselineScope,
    anomaly_capacity: usize,
    clock: Arc<dyn Clock>,
    series: RwLock<HashMap<BaselineKey, Arc<Mutex<Series>>>>,
    listeners: Listeners<Anomaly>,
}

impl AnomalyDetector {
    /// Creates a detector retaining `anomaly_capacity` anomalies per baseline.
    pub fn new(scope: BaselineScope, anomaly_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            scope,
            anomaly_capacity,
            clock,
            series: RwLock::new(HashMap::new()),
            listeners: Listeners::new("AnomalyDetector"),
        }
    }

    /// The baseline keying in use.
    pub fn scope(&self) -> BaselineScope {
        self.scope
    }

    /// Registers a callback invoked synchronously for every anomaly.
    pub fn on_anomaly<F>(&self, callback: F)
    where
        F: Fn(&Anomaly) + Send + Sync + 'static,
    {
        self.listeners.add(callback);
    }

    /// Adds `value` to its baseline, then judges it against the updated baseline.
    pub fn detect_anomalies(
        &self,
        metric_name: &str,
        value: f64,
        module_id: &ModuleId,
    ) -> Option<Anomaly> {
        if !value.is_finite() {
            log::debug!("AnomalyDetector: ignoring non-finite {metric_name} for '{module_id}'.");
            return None;
        }

        let series = self.series_for(metric_name, module_id);
        let anomaly = {
            let mut series = series.lock().unwrap_or_else(PoisonError::into_inner);
            series.baseline.add(value);
            if !series.baseline.is_anomalous(value) {
                return None;
            }
            let anomaly = self.build_anomaly(metric_name, value, module_id, &series.baseline);
            series.anomalies.push(anomaly.clone());
            anomaly
        };

        log::warn!(
            "AnomalyDetector: {} on '{}' ({}): {}",
            anomaly.anomaly_type,
            module_id,
            metric_name,
            anomaly.description
        );
        self.listeners.notify(&anomaly);
        Some(anomaly)
    }

    fn build_anomaly(
        &self,
        metric_name: &str,
        value: f64,
        module_id: &ModuleId,
        baseline: &MetricBaseline,
    ) -> Anomaly {
        let anomaly_type = AnomalyType::classify(metric_name);
        let severity = if value > baseline.mean() {
            Severity::High
        } else {
            Severity::Medium
        };
        let details = BTreeMap::from([
            ("current_value".to_owned(), value),
            ("baseline".to_owned(), baseline.mean()),
            ("stddev".to_owned(), baseline.stddev()),
        ]);
        Anomaly {
            id: Uuid::new_v4(),
            metric_name: metric_name.to_owned(),
            anomaly_type,
            severity,
            description: format!(
                "{anomaly_type} detected in {metric_name}: {value:.2} vs baseline {:.2} (stddev {:.2})",
                baseline.mean(),
                baseline.stddev()
            ),
            module_id: module_id.clone(),
            details,
            timestamp: self.clock.now(),
        }
    }

    fn key(&self, metric_name: &str, module_id: &ModuleId) -> BaselineKey {
        BaselineKey {
            module: match self.scope {
                BaselineScope::PerModule => Some(module_id.clone()),
                BaselineScope::Shared => None,
            },
            metric: metric_name.to_owned(),
        }
    }

    fn series_for(&self, metric_name: &str, module_id: &ModuleId) -> Arc<Mutex<Series>> {
        let key = self.key(metric_name, module_id);
        if let Some(existing) = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(existing);
        }
        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(series.entry(key).or_insert_with(|| {
            Arc::new(Mutex::new(Series {
                baseline: MetricBaseline::new(),
                anomalies: RingBuffer::new(self.anomaly_capacity),
            }))
        }))
    }

    /// Drops per-module baselines, and their anomalies, of modules not in
    /// `registered`. Shared baselines are kept.
    pub fn retain_modules(&self, registered: &HashSet<ModuleId>) {
        self.series
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.module.as_ref().map_or(true, |m| registered.contains(m)));
    }

    /// Mean, standard deviation and size of the baseline `metric_name` is
    /// judged against for `module_id`.
    pub fn baseline(&self, metric_name: &str, module_id: &ModuleId) -> Option<(f64, f64, usize)> {
        let key = self.key(metric_name, module_id);
        let series = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()?;
        let series = series.lock().unwrap_or_else(PoisonError::into_inner);
        Some((
            series.baseline.mean(),
            series.baseline.stddev(),
            series.baseline.sample_count(),
        ))
    }

    /// All retained anomalies detected within `window` of now, oldest first.
    pub fn recent_anomalies(&self, window: Duration) -> Vec<Anomaly> {
        let now = self.clock.now();
        let mut recent: Vec<Anomaly> = self
            .all_series()
            .iter()
            .flat_map(|series| {
                let series = series.lock().unwrap_or_else(PoisonError::into_inner);
                series
                    .anomalies
                    .iter()
                    .filter(|a| now.saturating_duration_since(a.timestamp) <= window)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        recent.sort_by_key(|a| a.timestamp);
        recent
    }

    /// All retained anomalies of one module, oldest first.
    pub fn anomalies_for(&self, module_id: &ModuleId) -> Vec<Anomaly> {
        let mut anomalies: Vec<Anomaly> = self
            .all_series()
            .iter()
            .flat_map(|series| {
                let series = series.lock().unwrap_or_else(PoisonError::into_inner);
                series
                    .anomalies
                    .iter()
                    .filter(|a| &a.module_id == module_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        anomalies.sort_by_key(|a| a.timestamp);
        anomalies
    }

    fn all_series(&self) -> Vec<Arc<Mutex<Series>>> {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("scope", &self.scope)
            .field("anomaly_capacity", &self.anomaly_capacity)
            .finish_non_exhaustive()
    }
}
