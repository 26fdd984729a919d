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

//! Registry for managing metrics.

use super::metric::{Metric, MetricSummary};
use modgov_core::telemetry::{MetricKind, MetricsError, MetricsResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type SharedMetric = Arc<Mutex<Metric>>;

/// Central registry of named metrics.
///
/// The map is only write-locked when a new metric is created. Recording into
/// an existing metric takes the read lock and that metric's own mutex, so
/// writers to different metrics do not contend.
#[derive(Debug, Default, Clone)]
pub struct MetricsRegistry {
    metrics: Arc<RwLock<HashMap<String, SharedMetric>>>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or looks up) a counter.
    pub fn counter(&self, name: &str) -> MetricsResult<CounterHandle> {
        self.entry(name, MetricKind::Counter).map(CounterHandle)
    }

    /// Registers (or looks up) a gauge.
    pub fn gauge(&self, name: &str) -> MetricsResult<GaugeHandle> {
        self.entry(name, MetricKind::Gauge).map(GaugeHandle)
    }

    /// Registers (or looks up) a timer.
    pub fn timer(&self, name: &str) -> MetricsResult<TimerHandle> {
        self.entry(name, MetricKind::Timer).map(TimerHandle)
    }

    /// Adds `delta` to the counter `name`, creating it if needed.
    pub fn record_counter(&self, name: &str, delta: f64) -> MetricsResult<()> {
        self.counter(name)?.increment_by(delta)
    }

    /// Sets the gauge `name`, creating it if needed.
    pub fn set_gauge(&self, name: &str, value: f64) -> MetricsResult<()> {
        self.gauge(name)?.set(value)
    }

    /// Records a duration into the timer `name`, creating it if needed.
    pub fn record_timer(&self, name: &str, millis: f64) -> MetricsResult<()> {
        self.timer(name)?.record(millis)
    }

    /// Returns a copy of the metric `name`.
    pub fn get(&self, name: &str) -> MetricsResult<Metric> {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        metrics
            .get(name)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .ok_or_else(|| MetricsError::MetricNotFound(name.to_owned()))
    }

    /// Current value of the metric `name`.
    pub fn value(&self, name: &str) -> MetricsResult<f64> {
        self.get(name).map(|m| m.value())
    }

    /// Check if a metric exists.
    pub fn contains(&self, name: &str) -> bool {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Copies of all metrics, sorted by name.
    pub fn snapshot(&self) -> Vec<Metric> {
        let shared: Vec<SharedMetric> = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut metrics: Vec<Metric> = shared
            .iter()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        metrics.sort_by(|a, b| a.name().cmp(b.name()));
        metrics
    }

    /// Summaries of all metrics as a JSON array, sorted by name.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let summaries: Vec<MetricSummary> = self.snapshot().iter().map(Metric::summary).collect();
        serde_json::to_string(&summaries)
    }

    /// Get the total number of metrics.
    pub fn metric_count(&self) -> usize {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Clear all metrics.
    pub fn clear_all(&self) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn entry(&self, name: &str, kind: MetricKind) -> MetricsResult<SharedMetric> {
        let existing = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let metric = match existing {
            Some(metric) => metric,
            None => {
                let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(metrics.entry(name.to_owned()).or_insert_with(|| {
                    log::trace!("Metrics: registered {kind:?} '{name}'.");
                    Arc::new(Mutex::new(Metric::new(name, kind)))
                }))
            }
        };

        let found = metric.lock().unwrap_or_else(PoisonError::into_inner).kind();
        if found != kind {
            return Err(MetricsError::TypeMismatch {
                name: name.to_owned(),
                expected: kind,
                found,
            });
        }
        Ok(metric)
    }
}

fn record(metric: &SharedMetric, sample: f64) -> MetricsResult<()> {
    metric
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record(sample)
}

fn current(metric: &SharedMetric) -> f64 {
    metric.lock().unwrap_or_else(PoisonError::into_inner).value()
}

/// Handle for efficient counter operations.
#[derive(Debug, Clone)]
pub struct CounterHandle(SharedMetric);

impl CounterHandle {
    /// Increment the counter by 1.
    pub fn increment(&self) -> MetricsResult<()> {
        self.increment_by(1.0)
    }

    /// Increment the counter by a non-negative amount.
    pub fn increment_by(&self, amount: f64) -> MetricsResult<()> {
        if amount < 0.0 {
            return Err(MetricsError::InvalidValue(format!(
                "counter increment must be non-negative, got {amount}"
            )));
        }
        record(&self.0, amount)
    }

    /// Get the current counter value.
    pub fn get(&self) -> f64 {
        current(&self.0)
    }
}

/// Handle for efficient gauge operations.
#[derive(Debug, Clone)]
pub struct GaugeHandle(SharedMetric);

impl GaugeHandle {
    /// Set the gauge to a specific value.
    pub fn set(&self, value: f64) -> MetricsResult<()> {
        record(&self.0, value)
    }

    /// Get the current gauge value.
    pub fn get(&self) -> f64 {
        current(&self.0)
    }
}

/// Handle for recording durations.
#[derive(Debug, Clone)]
pub struct TimerHandle(SharedMetric);

impl TimerHandle {
    /// Record a duration in milliseconds.
    pub fn record(&self, millis: f64) -> MetricsResult<()> {
        record(&self.0, millis)
    }

    /// The last recorded duration.
    pub fn last(&self) -> f64 {
        current(&self.0)
    }

    /// Copy of the underlying metric (for analysis).
    pub fn metric(&self) -> Metric {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
