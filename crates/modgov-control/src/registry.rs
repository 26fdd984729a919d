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

//! A module registry backed by a plain list of descriptors.

use modgov_core::{ModuleCategory, ModuleDescriptor, ModuleId, ModuleRegistry};
use std::fmt;
use std::sync::{Mutex, PoisonError, RwLock};

/// A lifecycle operation performed through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    /// `reset_module`.
    Reset,
    /// `restart_module`.
    Restart,
    /// `clear_caches`.
    ClearCaches,
}

type LifecycleHook = Box<dyn Fn(&ModuleId, LifecycleOp) -> anyhow::Result<()> + Send + Sync>;

/// Registry for hosts that know their modules up front.
///
/// Lifecycle operations are forwarded to an optional hook and recorded in
/// an operation log, in call order.
pub struct StaticModuleRegistry {
    modules: RwLock<Vec<ModuleDescriptor>>,
    hook: Option<LifecycleHook>,
    log: Mutex<Vec<(ModuleId, LifecycleOp)>>,
}

impl StaticModuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
            hook: None,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Installs the hook that carries out lifecycle operations.
    pub fn with_lifecycle_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ModuleId, LifecycleOp) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Registers a module, replacing any previous descriptor with the same id.
    pub fn register(&self, id: impl Into<ModuleId>, category: ModuleCategory) {
        let descriptor = ModuleDescriptor::new(id, category);
        log::info!(
            "ModuleRegistry: Registered '{}' ({:?})",
            descriptor.id,
            descriptor.category
        );
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        modules.retain(|m| m.id != descriptor.id);
        modules.push(descriptor);
    }

    /// Removes a module. Returns `false` if it was not registered.
    pub fn unregister(&self, id: &ModuleId) -> bool {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        let before = modules.len();
        modules.retain(|m| &m.id != id);
        before != modules.len()
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifecycle operations performed so far.
    pub fn lifecycle_log(&self) -> Vec<(ModuleId, LifecycleOp)> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn perform(&self, id: &ModuleId, op: LifecycleOp) -> anyhow::Result<()> {
        if self.category_of(id).is_none() {
            anyhow::bail!("module '{id}' is not registered");
        }
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.clone(), op));
        match &self.hook {
            Some(hook) => hook(id, op),
            None => {
                log::info!("ModuleRegistry: {op:?} on '{id}'");
                Ok(())
            }
        }
    }
}

impl Default for StaticModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StaticModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticModuleRegistry")
            .field("modules", &self.modules)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

impl ModuleRegistry for StaticModuleRegistry {
    fn modules(&self) -> Vec<ModuleDescriptor> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn reset_module(&self, id: &ModuleId) -> anyhow::Result<()> {
        self.perform(id, LifecycleOp::Reset)
    }

    fn restart_module(&self, id: &ModuleId) -> anyhow::Result<()> {
        self.perform(id, LifecycleOp::Restart)
    }

    fn clear_caches(&self, id: &ModuleId) -> anyhow::Result<()> {
        self.perform(id, LifecycleOp::ClearCaches)
    }
}
