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

//! Metric kinds and the errors of the metrics subsystem.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// How a metric interprets the values recorded into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Monotonically accumulated value.
    Counter,
    /// Point-in-time value that can go up and down.
    Gauge,
    /// Durations, in milliseconds.
    Timer,
}

/// A specialized `Result` type for metrics-related operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// An error that can occur within the metrics system.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsError {
    /// The requested metric was not found in the registry.
    MetricNotFound(String),
    /// An operation was attempted on a metric of the wrong kind
    /// (e.g. setting a gauge value on a counter).
    TypeMismatch {
        /// The metric name.
        name: String,
        /// The kind the operation expected.
        expected: MetricKind,
        /// The kind that is registered.
        found: MetricKind,
    },
    /// A value that cannot be recorded (NaN, negative counter increment...).
    InvalidValue(String),
}

impl Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsError::MetricNotFound(name) => write!(f, "Metric not found: {name}"),
            MetricsError::TypeMismatch {
                name,
                expected,
                found,
            } => {
                write!(
                    f,
                    "Type mismatch on '{name}': expected {expected:?}, found {found:?}"
                )
            }
            MetricsError::InvalidValue(msg) => write!(f, "Invalid value: {msg}"),
        }
    }
}

impl std::error::Error for MetricsError {}
