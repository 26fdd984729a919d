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

//! Rule-based configuration recommendations per load level.
//!
//! Training turns a module profile into one recommended configuration per
//! [`LoadLevel`]: a base table shared by every module, category specific
//! overrides, and a refinement for modules whose response time scales
//! poorly with load.

use crate::load::LoadLevel;
use crate::profile::{LoadScalingCharacteristics, ModuleProfile};
use modgov_core::config::describe;
use modgov_core::{ConfigMap, ConfigValue, ModuleCategory, ModuleId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Recommended configuration of one module for each load level.
#[derive(Debug, Clone)]
pub struct OptimizationModel {
    module_id: ModuleId,
    category: ModuleCategory,
    recommendations: Option<[ConfigMap; 3]>,
    scaling: Option<LoadScalingCharacteristics>,
    trained_on: usize,
}

impl OptimizationModel {
    /// Creates an untrained model.
    pub fn new(module_id: ModuleId, category: ModuleCategory) -> Self {
        Self {
            module_id,
            category,
            recommendations: None,
            scaling: None,
            trained_on: 0,
        }
    }

    /// `true` once [`OptimizationModel::train`] ran.
    pub fn is_trained(&self) -> bool {
        self.recommendations.is_some()
    }

    /// Data points of the last training.
    pub fn trained_on(&self) -> usize {
        self.trained_on
    }

    /// Scaling ratios observed at the last training.
    pub fn scaling(&self) -> Option<LoadScalingCharacteristics> {
        self.scaling
    }

    /// Derives the recommendations from `profile`.
    pub fn train(&mut self, profile: &ModuleProfile) {
        self.category = profile.category();
        self.scaling = profile.scaling();
        self.trained_on = profile.data_point_count();

        let scales_poorly = profile.scales_poorly();
        let recommendations = LoadLevel::ALL.map(|level| {
            let mut config = base_recommendation(level);
            apply_category(&mut config, self.category, level);
            if scales_poorly && level == LoadLevel::High {
                refine_for_poor_scaling(&mut config);
            }
            config
        });
        self.recommendations = Some(recommendations);

        log::info!(
            "Optimizer: trained model for '{}' ({:?}, {} points{}).",
            self.module_id,
            self.category,
            self.trained_on,
            if scales_poorly { ", scales poorly" } else { "" }
        );
    }

    /// The recommendation for `level`, if trained.
    pub fn recommendation(&self, level: LoadLevel) -> Option<&ConfigMap> {
        self.recommendations.as_ref().map(|r| &r[level.index()])
    }

    /// Keys of the recommendation for `current_load` that are missing from,
    /// or differ in, `current_config`. Empty for an untrained model.
    pub fn generate_optimized_config(&self, current_config: &ConfigMap, current_load: f64) -> ConfigMap {
        let level = LoadLevel::from_cpu_load(current_load);
        let Some(recommended) = self.recommendation(level) else {
            log::warn!(
                "Optimizer: model for '{}' is not trained, no configuration generated.",
                self.module_id
            );
            return ConfigMap::new();
        };

        let diff: ConfigMap = recommended
            .iter()
            .filter(|(key, value)| current_config.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !diff.is_empty() {
            log::debug!(
                "Optimizer: '{}' at {level} load, recommending {}.",
                self.module_id,
                describe(&diff)
            );
        }
        diff
    }
}

fn set(config: &mut ConfigMap, key: &str, value: impl Into<ConfigValue>) {
    config.insert(key.to_owned(), value.into());
}

fn base_recommendation(level: LoadLevel) -> ConfigMap {
    let (cache, batch, async_processing, compression, log_level) = match level {
        LoadLevel::Low => (1000, 5, false, 9, "FINE"),
        LoadLevel::Medium => (500, 10, true, 6, "INFO"),
        LoadLevel::High => (200, 20, true, 1, "WARNING"),
    };
    let mut config = ConfigMap::new();
    set(&mut config, "cacheSize", cache as i64);
    set(&mut config, "batchSize", batch as i64);
    set(&mut config, "asyncProcessing", async_processing);
    set(&mut config, "compressionLevel", compression as i64);
    set(&mut config, "logLevel", log_level);
    config
}

fn apply_category(config: &mut ConfigMap, category: ModuleCategory, level: LoadLevel) {
    match category {
        ModuleCategory::Backup => {
            let (interval, parallelism, compression) = match level {
                LoadLevel::Low => (15, 8, 9),
                LoadLevel::Medium => (30, 4, 6),
                LoadLevel::High => (60, 2, 1),
            };
            set(config, "backupInterval", interval as i64);
            set(config, "parallelism", parallelism as i64);
            set(config, "compressionLevel", compression as i64);
        }
        ModuleCategory::Database => {
            let (connections, timeout, batch) = match level {
                LoadLevel::Low => (20, 20_000, 25),
                LoadLevel::Medium => (10, 10_000, 50),
                LoadLevel::High => (5, 5_000, 100),
            };
            set(config, "maxConnections", connections as i64);
            set(config, "queryTimeout", timeout as i64);
            set(config, "batchSize", batch as i64);
        }
        ModuleCategory::Ui | ModuleCategory::General => {}
    }
}

fn refine_for_poor_scaling(config: &mut ConfigMap) {
    set(config, "asyncProcessing", true);
    if let Some(ConfigValue::Int(cache)) = config.get("cacheSize").cloned() {
        set(config, "cacheSize", (cache / 2).max(1));
    }
}

/// Optimization models of all modules.
#[derive(Debug, Default)]
pub struct ModelStore {
    models: RwLock<HashMap<ModuleId, Arc<Mutex<OptimizationModel>>>>,
}

impl ModelStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trains (or retrains) the model of the profiled module.
    pub fn train(&self, profile: &ModuleProfile) {
        let model = {
            let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(models.entry(profile.module_id().clone()).or_insert_with(|| {
                Arc::new(Mutex::new(OptimizationModel::new(
                    profile.module_id().clone(),
                    profile.category(),
                )))
            }))
        };
        model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .train(profile);
    }

    /// The configuration diff for `module`, or `None` without a trained model.
    pub fn optimized_config(
        &self,
        module: &ModuleId,
        current_config: &ConfigMap,
        current_load: f64,
    ) -> Option<ConfigMap> {
        let model = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()?;
        let model = model.lock().unwrap_or_else(PoisonError::into_inner);
        model
            .is_trained()
            .then(|| model.generate_optimized_config(current_config, current_load))
    }

    /// `true` when `module` has a trained model.
    pub fn is_trained(&self, module: &ModuleId) -> bool {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .is_some_and(|m| m.lock().unwrap_or_else(PoisonError::into_inner).is_trained())
    }

    /// Copy of the model of `module`.
    pub fn model(&self, module: &ModuleId) -> Option<OptimizationModel> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}
