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

//! Module configuration values and the store they live in.

use crate::module::ModuleId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// A boolean switch.
    Bool(bool),
    /// An integral setting.
    Int(i64),
    /// A floating point setting.
    Float(f64),
    /// A textual setting.
    Text(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::Int(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Float(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_owned())
    }
}

/// Ordered key/value configuration of one module.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// Renders a configuration map as compact JSON for logs and events.
pub fn describe(config: &ConfigMap) -> String {
    serde_json::to_string(config).unwrap_or_else(|e| format!("<unprintable config: {e}>"))
}

/// Persistence seam for module configuration.
pub trait ConfigStore: Send + Sync {
    /// The configuration currently in effect for `module`.
    fn current_config(&self, module: &ModuleId) -> anyhow::Result<ConfigMap>;

    /// Merges `diff` into the configuration of `module`.
    fn apply(&self, module: &ModuleId, diff: &ConfigMap) -> anyhow::Result<()>;
}

/// A process-local [`ConfigStore`].
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    configs: RwLock<HashMap<ModuleId, ConfigMap>>,
}

impl InMemoryConfigStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration of `module`.
    pub fn insert(&self, module: ModuleId, config: ConfigMap) {
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module, config);
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn current_config(&self, module: &ModuleId) -> anyhow::Result<ConfigMap> {
        Ok(self
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
            .unwrap_or_default())
    }

    fn apply(&self, module: &ModuleId, diff: &ConfigMap) -> anyhow::Result<()> {
        let mut configs = self.configs.write().unwrap_or_else(PoisonError::into_inner);
        let entry = configs.entry(module.clone()).or_default();
        for (key, value) in diff {
            entry.insert(key.clone(), value.clone());
        }
        log::debug!("ConfigStore: applied {} to '{module}'.", describe(diff));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_merges_into_existing_config() {
        let store = InMemoryConfigStore::new();
        let id = ModuleId::from("db");
        let mut initial = ConfigMap::new();
        initial.insert("cacheSize".into(), 1000_i64.into());
        initial.insert("logLevel".into(), "INFO".into());
        store.insert(id.clone(), initial);

        let mut diff = ConfigMap::new();
        diff.insert("cacheSize".into(), 200_i64.into());
        store.apply(&id, &diff).unwrap();

        let config = store.current_config(&id).unwrap();
        assert_eq!(config["cacheSize"], ConfigValue::Int(200));
        assert_eq!(config["logLevel"], ConfigValue::Text("INFO".into()));
    }

    #[test]
    fn test_unknown_module_has_empty_config() {
        let store = InMemoryConfigStore::new();
        assert!(store.current_config(&ModuleId::from("ghost")).unwrap().is_empty());
    }

    #[test]
    fn test_describe_renders_json() {
        let mut config = ConfigMap::new();
        config.insert("asyncProcessing".into(), true.into());
        config.insert("batchSize".into(), 20_i64.into());
        assert_eq!(describe(&config), r#"{"asyncProcessing":true,"batchSize":20}"#);
    }
}
