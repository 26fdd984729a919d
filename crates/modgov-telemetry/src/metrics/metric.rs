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

//! A named metric with a rolling sample window.

use modgov_core::telemetry::{MetricKind, MetricsError, MetricsResult};
use serde::Serialize;
use std::collections::VecDeque;

/// Number of samples a metric keeps by default.
pub const DEFAULT_WINDOW: usize = 1000;

/// A named series of observations.
///
/// Counters accumulate every recorded sample into their value, gauges take
/// the last value set and timers the last recorded duration. All three keep
/// the most recent samples for statistics.
#[derive(Debug, Clone)]
pub struct Metric {
    name: String,
    kind: MetricKind,
    value: f64,
    samples: VecDeque<f64>,
    window: usize,
}

impl Metric {
    /// Creates an empty metric with the default window.
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self::with_window(name, kind, DEFAULT_WINDOW)
    }

    /// Creates an empty metric keeping at most `window` samples.
    pub fn with_window(name: impl Into<String>, kind: MetricKind, window: usize) -> Self {
        let window = window.max(1);
        Self {
            name: name.into(),
            kind,
            value: 0.0,
            samples: VecDeque::with_capacity(window.min(DEFAULT_WINDOW)),
            window,
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The metric kind.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// The current value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Records an observation according to the metric kind.
    pub fn record(&mut self, sample: f64) -> MetricsResult<()> {
        if !sample.is_finite() {
            return Err(MetricsError::InvalidValue(format!(
                "'{}' cannot record {sample}",
                self.name
            )));
        }
        match self.kind {
            MetricKind::Counter => self.value += sample,
            MetricKind::Gauge | MetricKind::Timer => self.value = sample,
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Ok(())
    }

    /// Number of retained samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    /// Arithmetic mean of the retained samples, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Sample standard deviation (n − 1), 0 with fewer than two samples.
    pub fn stddev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq: f64 = self.samples.iter().map(|v| (v - mean) * (v - mean)).sum();
        (sum_sq / (n - 1) as f64).sqrt()
    }

    /// Smallest retained sample, 0 when empty.
    pub fn min(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    /// Largest retained sample, 0 when empty.
    pub fn max(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    /// Median of the retained samples, 0 when empty.
    pub fn median(&self) -> f64 {
        let sorted = self.sorted();
        let n = sorted.len();
        match n {
            0 => 0.0,
            _ if n % 2 == 0 => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
            _ => sorted[n / 2],
        }
    }

    /// Nearest-rank percentile, `p` in `[0, 100]`. 0 when empty.
    pub fn percentile(&self, p: f64) -> f64 {
        let sorted = self.sorted();
        if sorted.is_empty() {
            return 0.0;
        }
        let rank = (p.clamp(0.0, 100.0) / 100.0 * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }

    /// A serializable view of the metric statistics.
    pub fn summary(&self) -> MetricSummary {
        MetricSummary {
            name: self.name.clone(),
            kind: self.kind,
            value: self.value,
            count: self.sample_count(),
            mean: self.mean(),
            median: self.median(),
            stddev: self.stddev(),
            min: self.min(),
            max: self.max(),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

/// Statistics of a metric at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    /// The metric name.
    pub name: String,
    /// The metric kind.
    pub kind: MetricKind,
    /// The current value.
    pub value: f64,
    /// Retained sample count.
    pub count: usize,
    /// Mean of the samples.
    pub mean: f64,
    /// Median of the samples.
    pub median: f64,
    /// Sample standard deviation.
    pub stddev: f64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// 95th percentile.
    pub p95: f64,
    /// 99th percentile.
    pub p99: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gauge_with(values: &[f64]) -> Metric {
        let mut metric = Metric::new("g", MetricKind::Gauge);
        for v in values {
            metric.record(*v).unwrap();
        }
        metric
    }

    // --- Value semantics ---

    #[test]
    fn test_counter_accumulates() {
        let mut metric = Metric::new("requests", MetricKind::Counter);
        metric.record(2.0).unwrap();
        metric.record(3.0).unwrap();
        assert_eq!(metric.value(), 5.0);
        assert_eq!(metric.sample_count(), 2);
    }

    #[test]
    fn test_gauge_and_timer_keep_last_value() {
        let gauge = gauge_with(&[4.0, 1.0]);
        assert_eq!(gauge.value(), 1.0);

        let mut timer = Metric::new("t", MetricKind::Timer);
        timer.record(12.0).unwrap();
        timer.record(8.0).unwrap();
        assert_eq!(timer.value(), 8.0);
    }

    #[test]
    fn test_non_finite_sample_is_rejected() {
        let mut metric = Metric::new("g", MetricKind::Gauge);
        assert!(matches!(
            metric.record(f64::NAN),
            Err(MetricsError::InvalidValue(_))
        ));
        assert_eq!(metric.sample_count(), 0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut metric = Metric::with_window("g", MetricKind::Gauge, 3);
        for v in 1..=5 {
            metric.record(v as f64).unwrap();
        }
        assert_eq!(metric.samples().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_default_window_is_bounded() {
        let mut metric = Metric::new("g", MetricKind::Gauge);
        for v in 0..1500 {
            metric.record(v as f64).unwrap();
        }
        assert_eq!(metric.sample_count(), DEFAULT_WINDOW);
        assert_eq!(metric.min(), 500.0);
    }

    // --- Statistics ---

    #[test]
    fn test_mean_and_sample_stddev() {
        let metric = gauge_with(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_relative_eq!(metric.mean(), 5.0);
        // Sum of squared deviations is 32, over n - 1 = 7.
        assert_relative_eq!(metric.stddev(), (32.0f64 / 7.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(gauge_with(&[3.0, 1.0, 2.0]).median(), 2.0);
        assert_eq!(gauge_with(&[4.0, 1.0, 3.0, 2.0]).median(), 2.5);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let metric = gauge_with(&(1..=10).map(f64::from).collect::<Vec<_>>());
        assert_eq!(metric.percentile(50.0), 5.0);
        assert_eq!(metric.percentile(95.0), 10.0);
        assert_eq!(metric.percentile(0.0), 1.0);
        assert_eq!(metric.percentile(100.0), 10.0);
    }

    #[test]
    fn test_empty_metric_statistics() {
        let metric = Metric::new("empty", MetricKind::Timer);
        let summary = metric.summary();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.mean, 0.0);
        assert_eq!(summary.median, 0.0);
        assert_eq!(summary.p99, 0.0);
        assert_eq!(summary.stddev, 0.0);
    }
}
