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

//! Per-module performance profiles.
//!
//! A profile is the bounded history of what a module did under which host
//! load. It keeps aggregates over the retained history, per-load-level
//! buckets and, once enough data exists, how the module's response time
//! scales with load.

use crate::load::LoadLevel;
use crate::ring::RingBuffer;
use modgov_core::{ModuleCategory, ModuleId, ModuleStats, ServerSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// Data points needed before scaling characteristics are derived.
pub const MIN_POINTS_FOR_SCALING: usize = 10;
/// A load-to-load response time ratio above this means the module scales poorly.
pub const POOR_SCALING_RATIO: f64 = 2.0;
/// Samples kept per named operation.
const METHOD_HISTORY: usize = 1000;

/// Module statistics joined with the host snapshot taken at the same tick.
#[derive(Debug, Clone)]
pub struct DataPoint {
    /// What the module reported.
    pub stats: ModuleStats,
    /// What the host looked like.
    pub snapshot: ServerSnapshot,
    /// The snapshot's load level.
    pub load_level: LoadLevel,
}

impl DataPoint {
    /// When the data point was observed.
    pub fn timestamp(&self) -> Instant {
        self.snapshot.timestamp
    }
}

/// How a module's mean response time grows from one load level to the next.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadScalingCharacteristics {
    /// `avg(MEDIUM) / avg(LOW)`.
    pub low_to_medium: f64,
    /// `avg(HIGH) / avg(MEDIUM)`.
    pub medium_to_high: f64,
}

impl LoadScalingCharacteristics {
    /// Derives the ratios from per-level mean response times. A ratio whose
    /// operands are not both positive is neutral (1.0).
    pub fn from_level_averages(low: f64, medium: f64, high: f64) -> Self {
        Self {
            low_to_medium: ratio(medium, low),
            medium_to_high: ratio(high, medium),
        }
    }

    /// `true` when response time more than doubles between adjacent levels.
    pub fn scales_poorly(&self) -> bool {
        self.low_to_medium > POOR_SCALING_RATIO || self.medium_to_high > POOR_SCALING_RATIO
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if numerator > 0.0 && denominator > 0.0 {
        numerator / denominator
    } else {
        1.0
    }
}

#[derive(Debug, Clone)]
struct LoadBucket {
    response: RingBuffer<f64>,
    cpu: RingBuffer<f64>,
    memory: RingBuffer<f64>,
}

impl LoadBucket {
    fn new(capacity: usize) -> Self {
        Self {
            response: RingBuffer::new(capacity),
            cpu: RingBuffer::new(capacity),
            memory: RingBuffer::new(capacity),
        }
    }

    fn drop_oldest(&mut self) {
        self.response.pop_oldest();
        self.cpu.pop_oldest();
        self.memory.pop_oldest();
    }
}

/// Aggregates over the retained history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProfileAggregates {
    /// Mean response time, in milliseconds.
    pub avg_response_time_ms: f64,
    /// Peak response time, in milliseconds.
    pub peak_response_time_ms: f64,
    /// Mean CPU fraction.
    pub avg_cpu: f64,
    /// Peak CPU fraction.
    pub peak_cpu: f64,
    /// Mean memory, in bytes.
    pub avg_memory_bytes: f64,
    /// Peak memory, in bytes.
    pub peak_memory_bytes: f64,
}

/// Serializable digest of a profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSummary {
    /// The profiled module.
    pub module_id: ModuleId,
    /// Its category.
    pub category: ModuleCategory,
    /// Retained data points.
    pub data_points: usize,
    /// Aggregates over the retained history.
    pub aggregates: ProfileAggregates,
    /// Mean response time per load level, `LOW`, `MEDIUM`, `HIGH`.
    pub response_time_by_level: [f64; 3],
    /// Scaling ratios, once derived.
    pub scaling: Option<LoadScalingCharacteristics>,
}

/// Bounded performance history of one module.
#[derive(Debug, Clone)]
pub struct ModuleProfile {
    module_id: ModuleId,
    category: ModuleCategory,
    points: RingBuffer<DataPoint>,
    buckets: [LoadBucket; 3],
    aggregates: ProfileAggregates,
    scaling: Option<LoadScalingCharacteristics>,
    method_times: HashMap<String, RingBuffer<f64>>,
}

impl ModuleProfile {
    /// Creates an empty profile retaining at most `capacity` data points.
    pub fn new(module_id: ModuleId, category: ModuleCategory, capacity: usize) -> Self {
        Self {
            module_id,
            category,
            points: RingBuffer::new(capacity),
            buckets: [
                LoadBucket::new(capacity),
                LoadBucket::new(capacity),
                LoadBucket::new(capacity),
            ],
            aggregates: ProfileAggregates::default(),
            scaling: None,
            method_times: HashMap::new(),
        }
    }

    /// The profiled module.
    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    /// The module category.
    pub fn category(&self) -> ModuleCategory {
        self.category
    }

    /// Updates the category, e.g. after the module was re-registered.
    pub fn set_category(&mut self, category: ModuleCategory) {
        self.category = category;
    }

    /// Appends an observation, evicting the oldest one when full, and
    /// refreshes aggregates, buckets and scaling characteristics.
    pub fn add_data_point(&mut self, stats: ModuleStats, snapshot: ServerSnapshot) {
        let load_level = LoadLevel::from_cpu_load(snapshot.cpu_load);
        for (method, millis) in &stats.method_times {
            self.record_method_response_time(method, *millis);
        }
        let (response, cpu, memory) = (
            stats.avg_response_time_ms,
            stats.cpu_fraction,
            stats.memory_bytes as f64,
        );

        let evicted = self.points.push(DataPoint {
            stats,
            snapshot,
            load_level,
        });
        // Buckets are FIFO in point order, so the evicted point is the oldest
        // entry of its bucket.
        if let Some(evicted) = evicted {
            self.buckets[evicted.load_level.index()].drop_oldest();
        }

        let bucket = &mut self.buckets[load_level.index()];
        bucket.response.push(response);
        bucket.cpu.push(cpu);
        bucket.memory.push(memory);
        self.recompute_aggregates();

        if self.points.len() >= MIN_POINTS_FOR_SCALING {
            self.scaling = Some(LoadScalingCharacteristics::from_level_averages(
                self.buckets[0].response.average(),
                self.buckets[1].response.average(),
                self.buckets[2].response.average(),
            ));
        }
    }

    fn recompute_aggregates(&mut self) {
        let n = self.points.len();
        if n == 0 {
            self.aggregates = ProfileAggregates::default();
            return;
        }
        let mut agg = ProfileAggregates::default();
        for point in self.points.iter() {
            let s = &point.stats;
            agg.avg_response_time_ms += s.avg_response_time_ms;
            agg.peak_response_time_ms = agg.peak_response_time_ms.max(s.avg_response_time_ms);
            agg.avg_cpu += s.cpu_fraction;
            agg.peak_cpu = agg.peak_cpu.max(s.cpu_fraction);
            agg.avg_memory_bytes += s.memory_bytes as f64;
            agg.peak_memory_bytes = agg.peak_memory_bytes.max(s.memory_bytes as f64);
        }
        agg.avg_response_time_ms /= n as f64;
        agg.avg_cpu /= n as f64;
        agg.avg_memory_bytes /= n as f64;
        self.aggregates = agg;
    }

    /// Records one response time sample for a named operation.
    pub fn record_method_response_time(&mut self, method: &str, millis: f64) {
        self.method_times
            .entry(method.to_owned())
            .or_insert_with(|| RingBuffer::new(METHOD_HISTORY))
            .push(millis);
    }

    /// Retained response times of a named operation, oldest first.
    pub fn method_response_times(&self, method: &str) -> Vec<f64> {
        self.method_times
            .get(method)
            .map(|samples| samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of retained data points.
    pub fn data_point_count(&self) -> usize {
        self.points.len()
    }

    /// Retained data points, oldest first.
    pub fn data_points(&self) -> impl Iterator<Item = &DataPoint> {
        self.points.iter()
    }

    /// Data points observed within `[start, end]`.
    pub fn data_points_between(&self, start: Instant, end: Instant) -> Vec<&DataPoint> {
        self.points
            .iter()
            .filter(|p| p.timestamp() >= start && p.timestamp() <= end)
            .collect()
    }

    /// Aggregates over the retained history.
    pub fn aggregates(&self) -> ProfileAggregates {
        self.aggregates
    }

    /// Number of samples in a load level bucket.
    pub fn bucket_len(&self, level: LoadLevel) -> usize {
        self.buckets[level.index()].response.len()
    }

    /// Mean response time observed at `level`, 0 when none.
    pub fn predicted_response_time(&self, level: LoadLevel) -> f64 {
        self.buckets[level.index()].response.average()
    }

    /// Mean CPU fraction observed at `level`, 0 when none.
    pub fn average_cpu_at(&self, level: LoadLevel) -> f64 {
        self.buckets[level.index()].cpu.average()
    }

    /// Mean memory observed at `level`, 0 when none.
    pub fn average_memory_at(&self, level: LoadLevel) -> f64 {
        self.buckets[level.index()].memory.average()
    }

    /// Scaling characteristics, once enough data points exist.
    pub fn scaling(&self) -> Option<LoadScalingCharacteristics> {
        self.scaling
    }

    /// `true` when scaling characteristics exist and show poor scaling.
    pub fn scales_poorly(&self) -> bool {
        self.scaling.is_some_and(|s| s.scales_poorly())
    }

    /// A serializable digest of the profile.
    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            module_id: self.module_id.clone(),
            category: self.category,
            data_points: self.points.len(),
            aggregates: self.aggregates,
            response_time_by_level: LoadLevel::ALL.map(|l| self.predicted_response_time(l)),
            scaling: self.scaling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn snapshot(cpu_load: f64, at: Instant) -> ServerSnapshot {
        ServerSnapshot {
            cpu_load,
            ..ServerSnapshot::idle(at)
        }
    }

    fn stats(response: f64) -> ModuleStats {
        ModuleStats {
            avg_response_time_ms: response,
            cpu_fraction: 0.1,
            memory_bytes: 1024,
            ..Default::default()
        }
    }

    fn profile() -> ModuleProfile {
        ModuleProfile::new(ModuleId::from("db"), ModuleCategory::Database, 100)
    }

    // --- Buckets ---

    #[test]
    fn test_points_land_in_one_bucket() {
        let mut p = profile();
        let now = Instant::now();
        p.add_data_point(stats(10.0), snapshot(0.29, now));
        p.add_data_point(stats(10.0), snapshot(0.3, now));
        p.add_data_point(stats(10.0), snapshot(0.69, now));
        p.add_data_point(stats(10.0), snapshot(0.7, now));

        assert_eq!(p.bucket_len(LoadLevel::Low), 1);
        assert_eq!(p.bucket_len(LoadLevel::Medium), 2);
        assert_eq!(p.bucket_len(LoadLevel::High), 1);
        let total: usize = LoadLevel::ALL.iter().map(|l| p.bucket_len(*l)).sum();
        assert_eq!(total, p.data_point_count());
    }

    // --- Scaling ---

    #[test]
    fn test_scaling_requires_ten_points() {
        let mut p = profile();
        let now = Instant::now();
        for _ in 0..9 {
            p.add_data_point(stats(10.0), snapshot(0.1, now));
        }
        assert!(p.scaling().is_none());
        p.add_data_point(stats(10.0), snapshot(0.1, now));
        assert!(p.scaling().is_some());
    }

    #[test]
    fn test_scaling_ratio_matches_bucket_averages() {
        let mut p = profile();
        let now = Instant::now();
        for _ in 0..5 {
            p.add_data_point(stats(20.0), snapshot(0.1, now));
            p.add_data_point(stats(70.0), snapshot(0.5, now));
        }

        let scaling = p.scaling().unwrap();
        assert_relative_eq!(scaling.low_to_medium, 3.5);
        // No HIGH samples yet, so the upper ratio is neutral.
        assert_relative_eq!(scaling.medium_to_high, 1.0);
        assert!(p.scales_poorly());
    }

    #[test]
    fn test_zero_operands_give_neutral_ratio() {
        let scaling = LoadScalingCharacteristics::from_level_averages(0.0, 40.0, 0.0);
        assert_eq!(scaling.low_to_medium, 1.0);
        assert_eq!(scaling.medium_to_high, 1.0);
        assert!(!scaling.scales_poorly());
    }

    // --- History ---

    #[test]
    fn test_aggregates_follow_retained_history() {
        let mut p = ModuleProfile::new(ModuleId::from("ui"), ModuleCategory::Ui, 3);
        let now = Instant::now();
        for response in [100.0, 10.0, 20.0, 30.0] {
            p.add_data_point(stats(response), snapshot(0.1, now));
        }

        assert_eq!(p.data_point_count(), 3);
        let agg = p.aggregates();
        assert_relative_eq!(agg.avg_response_time_ms, 20.0);
        assert_relative_eq!(agg.peak_response_time_ms, 30.0);
    }

    #[test]
    fn test_eviction_keeps_buckets_in_step() {
        let mut p = ModuleProfile::new(ModuleId::from("ui"), ModuleCategory::Ui, 4);
        let now = Instant::now();
        for cpu in [0.9, 0.9, 0.1, 0.5, 0.1, 0.1, 0.1] {
            p.add_data_point(stats(10.0), snapshot(cpu, now));
        }

        // Retained loads: 0.5, 0.1, 0.1, 0.1.
        assert_eq!(p.data_point_count(), 4);
        assert_eq!(p.bucket_len(LoadLevel::High), 0);
        assert_eq!(p.bucket_len(LoadLevel::Medium), 1);
        assert_eq!(p.bucket_len(LoadLevel::Low), 3);
    }

    #[test]
    fn test_time_range_query() {
        let mut p = profile();
        let start = Instant::now();
        for minute in 0..5u64 {
            p.add_data_point(
                stats(10.0),
                snapshot(0.1, start + Duration::from_secs(minute * 60)),
            );
        }
        let window = p.data_points_between(
            start + Duration::from_secs(60),
            start + Duration::from_secs(180),
        );
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_method_times_are_recorded() {
        let mut p = profile();
        let mut s = stats(10.0);
        s.method_times = vec![("query".into(), 12.0)];
        p.add_data_point(s, snapshot(0.1, Instant::now()));
        p.record_method_response_time("query", 8.0);

        assert_eq!(p.method_response_times("query"), vec![12.0, 8.0]);
        assert!(p.method_response_times("flush").is_empty());
    }

    #[test]
    fn test_summary_reports_levels() {
        let mut p = profile();
        let now = Instant::now();
        p.add_data_point(stats(10.0), snapshot(0.1, now));
        p.add_data_point(stats(50.0), snapshot(0.9, now));

        let summary = p.summary();
        assert_eq!(summary.data_points, 2);
        assert_eq!(summary.response_time_by_level, [10.0, 0.0, 50.0]);
        assert_eq!(summary.category, ModuleCategory::Database);
    }
}
