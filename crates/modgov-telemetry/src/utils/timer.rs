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

//! Provides RAII-based timers for automatically recording durations.

use crate::metrics::registry::TimerHandle;
use std::time::Instant;

/// Times the enclosing scope and records the duration, in milliseconds, into
/// a timer metric when dropped.
///
/// The measurement is recorded on every exit path, including early returns
/// and unwinding.
pub struct ScopedTimer<'a> {
    started: Instant,
    timer: &'a TimerHandle,
}

impl<'a> ScopedTimer<'a> {
    /// Creates a new timer and starts it immediately.
    pub fn new(timer: &'a TimerHandle) -> Self {
        Self {
            started: Instant::now(),
            timer,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        if let Err(e) = self.timer.record(elapsed_ms) {
            log::warn!("[ScopedTimer] Failed to record metric: {e}");
        }
    }
}
