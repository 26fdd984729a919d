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

//! Trend-based prediction of future degradation.
//!
//! Each cycle pushes the current value of every sufficiently sampled metric
//! into a short trend window, fits a least-squares line per metric and runs
//! three rule families over the slopes: resource exhaustion, response time
//! degradation and throughput degradation.

use crate::severity::Severity;
use modgov_core::event::Listeners;
use modgov_core::Clock;
use modgov_telemetry::MetricsRegistry;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Points kept per trend.
pub const TREND_WINDOW: usize = 60;
/// Samples a metric needs before it contributes to a trend.
pub const MIN_METRIC_SAMPLES: usize = 10;
/// An issue with the same title is not reported again within this window.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(6 * 3600);
/// Issues older than this are forgotten.
pub const ISSUE_RETENTION: Duration = Duration::from_secs(24 * 3600);

const MINUTE: f64 = 60.0;
/// Resource rules fire once the value passes this share of the threshold.
const EXHAUSTION_WARNING_SHARE: f64 = 0.7;
/// Exhaustion forecasts further out than this are ignored, in minutes.
const EXHAUSTION_HORIZON_MIN: f64 = 1440.0;
const MEMORY_RATIO_THRESHOLD: f64 = 0.8;
const CPU_PERCENT_THRESHOLD: f64 = 90.0;
const DISK_PERCENT_THRESHOLD: f64 = 90.0;
const RESPONSE_SLOPE_THRESHOLD: f64 = 0.1;
const RESPONSE_TIME_FLOOR_MS: f64 = 100.0;
const RESPONSE_HORIZON: Duration = Duration::from_secs(3600);
const TPS_SLOPE_THRESHOLD: f64 = -0.01;
const TPS_WARNING_LEVEL: f64 = 18.0;
const TPS_CRITICAL_LEVEL: f64 = 10.0;
const TPS_HORIZON_MIN: f64 = 60.0;

/// Metric names the predictor knows about.
pub mod names {
    /// Used memory, in bytes.
    pub const MEMORY_USED: &str = "memory.used";
    /// Memory limit, in bytes.
    pub const MEMORY_MAX: &str = "memory.max";
    /// Host CPU usage, in percent.
    pub const CPU_USAGE: &str = "cpu.usage";
    /// Disk usage, in percent.
    pub const DISK_USAGE: &str = "disk.usage";
    /// Host ticks per second.
    pub const SERVER_TPS: &str = "server.tps";
    /// Live process threads.
    pub const SERVER_THREADS: &str = "server.threads";
}

/// A bounded series of `(time, value)` points with a least-squares slope.
#[derive(Debug, Clone)]
pub struct TrendAnalysis {
    points: VecDeque<(Instant, f64)>,
}

impl TrendAnalysis {
    /// Creates an empty trend.
    pub fn new() -> Self {
        Self {
            points: VecDeque::with_capacity(TREND_WINDOW),
        }
    }

    /// Appends a point, dropping the oldest beyond the window.
    pub fn add(&mut self, at: Instant, value: f64) {
        if self.points.len() == TREND_WINDOW {
            self.points.pop_front();
        }
        self.points.push_back((at, value));
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// `true` when no point was added.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Slope in value units per minute; x is minutes since the oldest point.
    /// Zero with fewer than two points or a degenerate fit.
    pub fn slope(&self) -> f64 {
        let n = self.points.len();
        if n < 2 {
            return 0.0;
        }
        let Some(&(origin, _)) = self.points.front() else {
            return 0.0;
        };
        let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
        for &(at, y) in &self.points {
            let x = at.saturating_duration_since(origin).as_secs_f64() / MINUTE;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_xx += x * x;
        }
        let n = n as f64;
        let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_xx - sum_x * sum_x);
        if slope.is_finite() {
            slope
        } else {
            0.0
        }
    }

    /// The newest value, 0 when empty.
    pub fn latest_value(&self) -> f64 {
        self.points.back().map(|&(_, v)| v).unwrap_or(0.0)
    }

    /// Extrapolates the newest value along the slope to `at`.
    pub fn predict_value(&self, at: Instant) -> f64 {
        let Some(&(last_at, last)) = self.points.back() else {
            return 0.0;
        };
        let minutes = if at >= last_at {
            at.duration_since(last_at).as_secs_f64() / MINUTE
        } else {
            -(last_at.duration_since(at).as_secs_f64() / MINUTE)
        };
        last + self.slope() * minutes
    }
}

impl Default for TrendAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

/// A forecast problem.
#[derive(Debug, Clone, Serialize)]
pub struct PredictedIssue {
    /// Unique id.
    pub id: Uuid,
    /// Urgency.
    pub severity: Severity,
    /// Short title, also the deduplication key.
    pub title: String,
    /// Human-readable explanation.
    pub description: String,
    /// The metric the forecast is based on.
    pub metric_name: String,
    /// When the forecast was made.
    #[serde(skip)]
    pub predicted_at: Instant,
    /// When the problem is expected.
    #[serde(skip)]
    pub estimated_occurrence: Instant,
}

impl PredictedIssue {
    /// Time between the forecast and the expected occurrence.
    pub fn lead_time(&self) -> Duration {
        self.estimated_occurrence
            .saturating_duration_since(self.predicted_at)
    }
}

struct Candidate {
    severity: Severity,
    title: String,
    description: String,
    metric_name: String,
    eta: Duration,
}

fn minutes(m: f64) -> Duration {
    Duration::from_secs_f64(m * MINUTE)
}

/// Forecasts resource exhaustion and degradation from metric trends.
pub struct PerformancePredictor {
    clock: Arc<dyn Clock>,
    trends: Mutex<HashMap<String, TrendAnalysis>>,
    issues: Mutex<Vec<PredictedIssue>>,
    listeners: Listeners<PredictedIssue>,
}

impl PerformancePredictor {
    /// Creates a predictor with no history.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            trends: Mutex::new(HashMap::new()),
            issues: Mutex::new(Vec::new()),
            listeners: Listeners::new("Predictor"),
        }
    }

    /// Registers a callback invoked synchronously for every new issue.
    pub fn on_predicted_issue<F>(&self, callback: F)
    where
        F: Fn(&PredictedIssue) + Send + Sync + 'static,
    {
        self.listeners.add(callback);
    }

    /// Runs one prediction cycle and returns the newly reported issues.
    pub fn predict(&self, metrics: &MetricsRegistry) -> Vec<PredictedIssue> {
        let now = self.clock.now();

        let candidates = {
            let mut trends = self.trends.lock().unwrap_or_else(PoisonError::into_inner);
            for metric in metrics.snapshot() {
                if metric.sample_count() >= MIN_METRIC_SAMPLES {
                    trends
                        .entry(metric.name().to_owned())
                        .or_default()
                        .add(now, metric.value());
                }
            }

            let mut candidates = Vec::new();
            candidates.extend(Self::memory_exhaustion(&trends));
            candidates.extend(Self::percent_exhaustion(
                &trends,
                names::CPU_USAGE,
                "CPU",
                CPU_PERCENT_THRESHOLD,
            ));
            candidates.extend(Self::percent_exhaustion(
                &trends,
                names::DISK_USAGE,
                "Disk",
                DISK_PERCENT_THRESHOLD,
            ));
            candidates.extend(Self::response_time_degradation(&trends));
            candidates.extend(Self::throughput_degradation(&trends));
            candidates
        };

        let reported = {
            let mut issues = self.issues.lock().unwrap_or_else(PoisonError::into_inner);
            issues.retain(|i| now.saturating_duration_since(i.predicted_at) <= ISSUE_RETENTION);

            let mut reported = Vec::new();
            for candidate in candidates {
                let duplicate = issues.iter().any(|i| {
                    i.title == candidate.title
                        && now.saturating_duration_since(i.predicted_at) < DEDUP_WINDOW
                });
                if duplicate {
                    log::trace!("Predictor: suppressed duplicate '{}'.", candidate.title);
                    continue;
                }
                let issue = PredictedIssue {
                    id: Uuid::new_v4(),
                    severity: candidate.severity,
                    title: candidate.title,
                    description: candidate.description,
                    metric_name: candidate.metric_name,
                    predicted_at: now,
                    estimated_occurrence: now + candidate.eta,
                };
                issues.push(issue.clone());
                reported.push(issue);
            }
            reported
        };

        for issue in &reported {
            log::warn!(
                "Predictor: [{}] {} (in {:.0} min): {}",
                issue.severity,
                issue.title,
                issue.lead_time().as_secs_f64() / MINUTE,
                issue.description
            );
            self.listeners.notify(issue);
        }
        reported
    }

    fn memory_exhaustion(trends: &HashMap<String, TrendAnalysis>) -> Option<Candidate> {
        let used = trends.get(names::MEMORY_USED)?;
        let max = trends.get(names::MEMORY_MAX)?.latest_value();
        if max <= 0.0 {
            return None;
        }
        let ratio = used.latest_value() / max;
        let slope = used.slope() / max;
        let eta = Self::exhaustion_eta(ratio, slope, MEMORY_RATIO_THRESHOLD)?;
        Some(Candidate {
            severity: Severity::High,
            title: "Memory exhaustion predicted".into(),
            description: format!(
                "Memory at {:.1}% and rising {:.2}%/min, {:.0}% expected in {:.0} min",
                ratio * 100.0,
                slope * 100.0,
                MEMORY_RATIO_THRESHOLD * 100.0,
                eta
            ),
            metric_name: names::MEMORY_USED.into(),
            eta: minutes(eta),
        })
    }

    fn percent_exhaustion(
        trends: &HashMap<String, TrendAnalysis>,
        metric: &str,
        resource: &str,
        threshold: f64,
    ) -> Option<Candidate> {
        let trend = trends.get(metric)?;
        let current = trend.latest_value();
        let slope = trend.slope();
        let eta = Self::exhaustion_eta(current, slope, threshold)?;
        Some(Candidate {
            severity: Severity::High,
            title: format!("{resource} exhaustion predicted"),
            description: format!(
                "{resource} usage at {current:.1}% and rising {slope:.2}%/min, {threshold:.0}% expected in {eta:.0} min"
            ),
            metric_name: metric.into(),
            eta: minutes(eta),
        })
    }

    /// Minutes until `threshold` is reached, when the rule applies.
    fn exhaustion_eta(current: f64, slope: f64, threshold: f64) -> Option<f64> {
        if current <= EXHAUSTION_WARNING_SHARE * threshold || slope <= 0.0 {
            return None;
        }
        let eta = (threshold - current) / slope;
        (eta > 0.0 && eta < EXHAUSTION_HORIZON_MIN).then_some(eta)
    }

    fn response_time_degradation(trends: &HashMap<String, TrendAnalysis>) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = trends
            .iter()
            .filter(|(name, _)| name.contains("response.time") || name.contains("operation"))
            .filter_map(|(name, trend)| {
                let slope = trend.slope();
                let current = trend.latest_value();
                (slope > RESPONSE_SLOPE_THRESHOLD && current > RESPONSE_TIME_FLOOR_MS).then(|| {
                    Candidate {
                        severity: Severity::Medium,
                        title: format!("Response time degradation predicted for {name}"),
                        description: format!(
                            "{name} at {current:.1} ms and rising {slope:.2} ms/min"
                        ),
                        metric_name: name.clone(),
                        eta: RESPONSE_HORIZON,
                    }
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.title.cmp(&b.title));
        candidates
    }

    fn throughput_degradation(trends: &HashMap<String, TrendAnalysis>) -> Option<Candidate> {
        let trend = trends.get(names::SERVER_TPS)?;
        let slope = trend.slope();
        let current = trend.latest_value();
        if slope >= TPS_SLOPE_THRESHOLD || current >= TPS_WARNING_LEVEL {
            return None;
        }
        let eta = (TPS_CRITICAL_LEVEL - current) / slope;
        if !(eta > 0.0 && eta < TPS_HORIZON_MIN) {
            return None;
        }
        Some(Candidate {
            severity: Severity::Critical,
            title: "Server TPS degradation predicted".into(),
            description: format!(
                "TPS at {current:.2} and falling {:.2}/min, below {TPS_CRITICAL_LEVEL:.0} in {eta:.0} min",
                -slope
            ),
            metric_name: names::SERVER_TPS.into(),
            eta: minutes(eta),
        })
    }

    /// Issues reported within `window` of now, oldest first.
    pub fn recent_issues(&self, window: Duration) -> Vec<PredictedIssue> {
        let now = self.clock.now();
        self.issues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|i| now.saturating_duration_since(i.predicted_at) <= window)
            .cloned()
            .collect()
    }

    /// Every retained issue, oldest first.
    pub fn all_issues(&self) -> Vec<PredictedIssue> {
        self.issues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Copy of the trend of `metric`, if it has one.
    pub fn trend(&self, metric: &str) -> Option<TrendAnalysis> {
        self.trends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(metric)
            .cloned()
    }
}

impl fmt::Debug for PerformancePredictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformancePredictor").finish_non_exhaustive()
    }
}
