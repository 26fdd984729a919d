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

//! Abstractions for periodic background work.
//!
//! Components never own threads. They hand periodic closures to a shared
//! [`TaskScheduler`], which decides how many threads run them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A unit of periodic work.
pub type TaskFn = Arc<dyn Fn() + Send + Sync>;

/// Handle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Runs periodic tasks.
///
/// Implementations must never run a task concurrently with itself. When a
/// run is still in flight at its next due time, that tick is skipped.
pub trait TaskScheduler: Send + Sync {
    /// Schedules `task` to first run after `initial_delay`, then every `period`.
    fn schedule_periodic(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        task: TaskFn,
    ) -> TaskId;

    /// Stops future runs of `id`. Returns `false` if the task is unknown.
    ///
    /// A run already in progress is not interrupted.
    fn cancel(&self, id: TaskId) -> bool;

    /// Waits until no task is running, for at most `timeout`.
    ///
    /// Returns `true` if the scheduler became idle in time.
    fn quiesce(&self, timeout: Duration) -> bool;
}
