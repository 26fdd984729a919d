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

//! # Modgov Core
//!
//! Foundational crate containing the shared data types and collaborator
//! contracts of the adaptive module governor: server snapshots, module
//! identities and categories, configuration values, clocks, task scheduling
//! and a generic event bus.

#![warn(missing_docs)]

pub mod config;
pub mod event;
pub mod module;
pub mod scheduler;
pub mod telemetry;
pub mod time;

pub use config::{ConfigMap, ConfigStore, ConfigValue};
pub use module::{ModuleCategory, ModuleDescriptor, ModuleId, ModuleRegistry};
pub use scheduler::{TaskFn, TaskId, TaskScheduler};
pub use telemetry::{MetricSource, MetricsError, MetricsResult, ModuleStats, ServerSnapshot};
pub use time::{Clock, ManualClock, SystemClock};
