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

//! # Modgov Control
//!
//! The adaptive module performance governor: per-module profiling, anomaly
//! detection, trend prediction, rule-based configuration optimization,
//! thread budget balancing with an admission gate, and self-healing.
//!
//! [`Governor`] wires these components to the host's collaborators and runs
//! them on a shared [`modgov_core::TaskScheduler`].

#![warn(missing_docs)]

pub mod anomaly;
pub mod balancer;
pub mod config;
pub mod error;
pub mod governor;
pub mod healing;
pub mod health;
pub mod load;
pub mod optimization;
pub mod prediction;
pub mod profile;
pub mod registry;
pub mod ring;
pub mod scheduler;
pub mod severity;

pub use anomaly::{Anomaly, AnomalyDetector, AnomalyType, BaselineScope};
pub use balancer::{AdmissionPermit, AllocationSnapshot, BalancerCommand, LoadBalancer};
pub use config::GovernorConfig;
pub use error::{GovernorError, GovernorResult};
pub use governor::{Collaborators, Governor, GovernorEvent, GovernorTask};
pub use healing::{ActionExecutor, HealingAction, HealingActionType, SelfHealingManager};
pub use health::{HealthIssue, HealthIssueType, HealthState, ModuleHealthStatus};
pub use load::LoadLevel;
pub use prediction::{PerformancePredictor, PredictedIssue};
pub use profile::{ModuleProfile, ProfileSummary};
pub use registry::{LifecycleOp, StaticModuleRegistry};
pub use scheduler::{ManualScheduler, WorkerScheduler};
pub use severity::Severity;
