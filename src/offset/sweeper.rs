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

use std::collections::HashMap;

use tracing::{debug, info};

use super::{GroupTopicKey, LogicalOffset, OffsetManager};

impl OffsetManager {
    /// One sweep pass: drops the entries of groups that no longer subscribe
    /// to the topic and whose offsets all point at data retention already
    /// deleted. Returns the removed keys.
    ///
    /// An entry is kept whenever something is uncertain: a partition that
    /// cannot be resolved, or a commit that raced with the pass.
    pub async fn sweep(&self) -> Vec<GroupTopicKey> {
        let mut removed = Vec::new();
        for key in self.table.keys() {
            if self
                .subscriptions
                .has_active_subscription(&key.group, key.topic.as_str())
            {
                continue;
            }
            let Some(offsets) = self.table.partitions(&key) else {
                continue;
            };
            if offsets.is_empty() || !self.behind_retained_data(&key, &offsets).await {
                continue;
            }
            if self.table.remove_if_unchanged(&key, &offsets) {
                info!(
                    monotonic_counter.sweep_removals = 1_u64,
                    "remove offsets of {}, all behind retained data", key
                );
                removed.push(key);
            } else {
                debug!("offsets of {} changed during sweep, keep them", key);
            }
        }
        removed
    }

    async fn behind_retained_data(
        &self,
        key: &GroupTopicKey,
        offsets: &HashMap<i32, LogicalOffset>,
    ) -> bool {
        for (partition, offset) in offsets {
            match self.min_offset(key.topic.as_str(), *partition).await {
                Ok(min) if *offset <= min => {}
                Ok(_) => return false,
                Err(e) => {
                    debug!(
                        "keep offsets of {}, partition {} unresolved: {}",
                        key, partition, e
                    );
                    return false;
                }
            }
        }
        true
    }
}
