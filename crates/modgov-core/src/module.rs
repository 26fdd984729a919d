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

//! Module identity, categories and the registry contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of an extension module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    /// Creates a new module id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ModuleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Functional category a module declares when it is registered.
///
/// Categories drive the balancer's score multiplier and the category
/// specific configuration recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ModuleCategory {
    /// No particular workload profile.
    #[default]
    General,
    /// Query heavy module backed by a connection pool.
    Database,
    /// Periodic snapshot and archiving work.
    Backup,
    /// Interactive, latency sensitive module.
    Ui,
}

impl ModuleCategory {
    /// Multiplier applied to the balancer score of modules in this category.
    pub fn balance_weight(self) -> f64 {
        match self {
            ModuleCategory::Database => 1.5,
            ModuleCategory::Backup => 0.8,
            ModuleCategory::Ui => 1.3,
            ModuleCategory::General => 1.0,
        }
    }
}

/// A registered module and its category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// The module identifier.
    pub id: ModuleId,
    /// The category supplied at registration.
    pub category: ModuleCategory,
}

impl ModuleDescriptor {
    /// Creates a descriptor.
    pub fn new(id: impl Into<ModuleId>, category: ModuleCategory) -> Self {
        Self {
            id: id.into(),
            category,
        }
    }
}

/// Source of truth for loaded modules and their lifecycle.
///
/// The lifecycle hooks are invoked by remediation. The default bodies only
/// log, which suits hosts that cannot reset or restart a module in place.
pub trait ModuleRegistry: Send + Sync {
    /// All currently loaded modules.
    fn modules(&self) -> Vec<ModuleDescriptor>;

    /// Looks up the category of a module, if it is loaded.
    fn category_of(&self, id: &ModuleId) -> Option<ModuleCategory> {
        self.modules()
            .into_iter()
            .find(|descriptor| &descriptor.id == id)
            .map(|descriptor| descriptor.category)
    }

    /// Resets the module's internal state.
    fn reset_module(&self, id: &ModuleId) -> anyhow::Result<()> {
        log::info!("Registry: reset requested for module '{id}'.");
        Ok(())
    }

    /// Unloads and reloads the module.
    fn restart_module(&self, id: &ModuleId) -> anyhow::Result<()> {
        log::info!("Registry: restart requested for module '{id}'.");
        Ok(())
    }

    /// Drops cached data held by the module.
    fn clear_caches(&self, id: &ModuleId) -> anyhow::Result<()> {
        log::info!("Registry: cache clear requested for module '{id}'.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRegistry(Vec<ModuleDescriptor>);

    impl ModuleRegistry for FixedRegistry {
        fn modules(&self) -> Vec<ModuleDescriptor> {
            self.0.clone()
        }
    }

    #[test]
    fn test_module_id_conversions() {
        let a = ModuleId::from("backup");
        let b = ModuleId::new(String::from("backup"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "backup");
        assert_eq!(a.as_str(), "backup");
    }

    #[test]
    fn test_category_weights() {
        assert_eq!(ModuleCategory::Database.balance_weight(), 1.5);
        assert_eq!(ModuleCategory::Backup.balance_weight(), 0.8);
        assert_eq!(ModuleCategory::Ui.balance_weight(), 1.3);
        assert_eq!(ModuleCategory::General.balance_weight(), 1.0);
    }

    #[test]
    fn test_registry_defaults() {
        let registry = FixedRegistry(vec![
            ModuleDescriptor::new("db", ModuleCategory::Database),
            ModuleDescriptor::new("chat", ModuleCategory::General),
        ]);

        assert_eq!(
            registry.category_of(&ModuleId::from("db")),
            Some(ModuleCategory::Database)
        );
        assert_eq!(registry.category_of(&ModuleId::from("missing")), None);
        assert!(registry.reset_module(&ModuleId::from("db")).is_ok());
        assert!(registry.restart_module(&ModuleId::from("db")).is_ok());
        assert!(registry.clear_caches(&ModuleId::from("db")).is_ok());
    }
}
