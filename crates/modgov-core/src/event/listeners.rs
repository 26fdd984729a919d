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

//! Synchronous callback lists.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of callbacks invoked synchronously, in registration order.
///
/// Each callback runs inside `catch_unwind`, so one faulty listener neither
/// stops the others nor unwinds into the component that notifies them.
pub struct Listeners<T> {
    name: &'static str,
    callbacks: RwLock<Vec<Callback<T>>>,
}

impl<T> Listeners<T> {
    /// Creates an empty list. `name` is used as the log prefix.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Registers a new callback.
    pub fn add<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every callback with `value`.
    ///
    /// Returns the number of callbacks that panicked.
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot so a callback may register further listeners without deadlocking.
        let callbacks: Vec<Callback<T>> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = 0;
        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                failures += 1;
                log::error!("{}: listener panicked, continuing with the next one.", self.name);
            }
        }
        failures
    }
}

impl<T> std::fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
