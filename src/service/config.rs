// Copyright 2025 jonefeewang@gmail.com
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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::partition::BackoffConfig;

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub id: i32,
    /// Groups whose name starts with one of these prefixes are internal:
    /// they are never persisted to the store and never seeded from it.
    pub system_group_prefixes: Vec<String>,
    /// Where the local storage backend checkpoints its cursors.
    pub cursor_checkpoint_path: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            id: 0,
            system_group_prefixes: vec![
                "rocketmq/__rocketmq".to_string(),
                "public/default".to_string(),
            ],
            cursor_checkpoint_path: "cursor-checkpoint".to_string(),
        }
    }
}

/// Partition lookup retry schedule and the bound on how long a request
/// waits for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub mandatory_stop_ms: u64,
    pub max_attempts: u32,
    pub caller_wait_ms: u64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            mandatory_stop_ms: 10_000,
            max_attempts: 10,
            caller_wait_ms: 3_000,
        }
    }
}

impl ResolutionConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.initial_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            mandatory_stop: Duration::from_millis(self.mandatory_stop_ms),
            max_attempts: self.max_attempts,
        }
    }

    pub fn caller_wait(&self) -> Duration {
        Duration::from_millis(self.caller_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// 0 disables the periodic pass; the shutdown pass always runs.
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub partitions: i32,
}

/// Topics served by the local storage backend in standalone mode.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub general: GeneralConfig,
    pub resolution: ResolutionConfig,
    pub sweeper: SweeperConfig,
    pub persist: PersistConfig,
    pub storage: StorageConfig,
}

impl BridgeConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BridgeConfig> {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let bridge_config: BridgeConfig = config.try_deserialize()?;
        bridge_config.validate()?;
        Ok(bridge_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let resolution = &self.resolution;
        if resolution.initial_backoff_ms == 0 {
            return Err(AppError::InvalidValue(
                "resolution.initial_backoff_ms must be positive".to_string(),
            ));
        }
        if resolution.max_backoff_ms < resolution.initial_backoff_ms {
            return Err(AppError::InvalidValue(format!(
                "resolution.max_backoff_ms {} is below initial_backoff_ms {}",
                resolution.max_backoff_ms, resolution.initial_backoff_ms
            )));
        }
        if resolution.max_attempts == 0 {
            return Err(AppError::InvalidValue(
                "resolution.max_attempts must be positive".to_string(),
            ));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(AppError::InvalidValue(
                "sweeper.interval_secs must be positive".to_string(),
            ));
        }
        if let Some(topic) = self.storage.topics.iter().find(|t| t.partitions <= 0) {
            return Err(AppError::InvalidValue(format!(
                "topic {} has {} partitions",
                topic.name, topic.partitions
            )));
        }
        Ok(())
    }
}
