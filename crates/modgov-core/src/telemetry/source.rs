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

use super::snapshot::{ModuleStats, ServerSnapshot};
use crate::module::ModuleId;

/// Supplier of raw host and module observations.
///
/// Sampling the operating system is the implementor's business. The governor
/// only asks for one snapshot and one stats record per module per tick.
pub trait MetricSource: Send + Sync {
    /// Observes the host.
    fn snapshot(&self) -> anyhow::Result<ServerSnapshot>;

    /// Observes a single module.
    fn module_stats(&self, module: &ModuleId) -> anyhow::Result<ModuleStats>;
}
