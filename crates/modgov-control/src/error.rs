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

//! Errors raised by the governor.

use modgov_core::ModuleId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the governor.
///
/// Failures inside a periodic cycle are logged with the module id and never
/// escape the cycle. Configuration, queries, on-demand optimization and
/// shutdown report errors.
#[derive(Debug, Error)]
pub enum GovernorError {
    /// The module is not known to the component that was queried.
    #[error("unknown module '{0}'")]
    UnknownModule(ModuleId),

    /// No data point has been recorded for the module yet.
    #[error("no profile recorded for module '{0}'")]
    MissingProfile(ModuleId),

    /// A collaborator (metric source, registry, config store) failed.
    #[error("collaborator failure: {0}")]
    Collaborator(#[from] anyhow::Error),

    /// The RON configuration could not be parsed.
    #[error("failed to parse governor configuration: {0}")]
    ConfigParse(#[from] ron::error::SpannedError),

    /// The configuration file could not be read.
    #[error("failed to read governor configuration '{path}': {source}")]
    ConfigIo {
        /// The file that was read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration parsed but holds unusable values.
    #[error("invalid governor configuration: {0}")]
    InvalidConfig(String),

    /// A scheduler thread could not be spawned.
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// In-flight work did not finish within the shutdown timeout.
    #[error("scheduler did not go idle within {0:?}")]
    ShutdownTimedOut(Duration),
}

/// A specialized `Result` type for governor operations.
pub type GovernorResult<T> = Result<T, GovernorError>;
