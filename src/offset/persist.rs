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

use tracing::{debug, trace, warn};

use crate::AppError::PersistPartialFailure;
use crate::AppResult;

use super::codec::decode;
use super::{GroupTopicKey, LogicalOffset, OffsetManager, PhysicalPosition};

/// Outcome of one persist pass, counted per (group, topic, partition).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    pub persisted: usize,
    pub failed: usize,
    /// Table entries of system groups, left to the store itself.
    pub skipped_system: usize,
}

impl PersistReport {
    pub fn total(&self) -> usize {
        self.persisted + self.failed
    }

    pub fn into_result(self) -> AppResult<PersistReport> {
        if self.failed > 0 {
            return Err(PersistPartialFailure {
                failed: self.failed,
                total: self.total(),
            });
        }
        Ok(self)
    }
}

impl OffsetManager {
    /// Writes every committed offset of a non-system group into the
    /// matching durable cursor of the store.
    ///
    /// Best effort: a partition that fails is logged and counted, the pass
    /// carries on with the rest.
    pub async fn persist(&self) -> PersistReport {
        let _guard = self.persist_lock.lock().await;
        let mut report = PersistReport::default();

        for key in self.table.keys() {
            if self.is_system_group(&key.group) {
                report.skipped_system += 1;
                continue;
            }
            let Some(offsets) = self.table.partitions(&key) else {
                continue;
            };
            for (partition, offset) in offsets {
                match self.persist_partition(&key, partition, offset).await {
                    Ok(position) => {
                        report.persisted += 1;
                        trace!(
                            "persisted {} partition {} at {}",
                            key,
                            partition,
                            position
                        );
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            monotonic_counter.persist_failures = 1_u64,
                            "persist {} partition {} offset {} error: {}",
                            key,
                            partition,
                            offset,
                            e
                        );
                    }
                }
            }
        }

        debug!(
            "persist pass done, {} persisted, {} failed, {} system entries skipped",
            report.persisted, report.failed, report.skipped_system
        );
        report
    }

    async fn persist_partition(
        &self,
        key: &GroupTopicKey,
        partition: i32,
        offset: LogicalOffset,
    ) -> AppResult<PhysicalPosition> {
        let position = decode(offset)?;
        let handle = self.cache.resolve(key.topic.as_str(), partition).await?;
        let cursor = handle.get_or_create_cursor(&key.group).await?;
        cursor.reset_to(position).await?;
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::offset::codec::encode;
    use crate::partition::{BackoffConfig, PartitionCache};
    use crate::storage::{CursorHandle, LocalStorage, LocalSubscriptions};
    use crate::AppError;

    fn manager_over(storage: Arc<LocalStorage>) -> OffsetManager {
        let cache = Arc::new(PartitionCache::new(
            storage,
            BackoffConfig::default(),
            Duration::from_secs(3),
        ));
        OffsetManager::new(
            cache,
            Arc::new(LocalSubscriptions::new()),
            vec!["sys/".to_string()],
        )
    }

    #[test]
    fn test_report_into_result() {
        let report = PersistReport {
            persisted: 2,
            failed: 0,
            skipped_system: 1,
        };
        assert_eq!(report.into_result().unwrap(), report);

        let report = PersistReport {
            persisted: 2,
            failed: 1,
            skipped_system: 0,
        };
        assert!(matches!(
            report.into_result(),
            Err(AppError::PersistPartialFailure { failed: 1, total: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_resets_cursors() {
        let storage = Arc::new(LocalStorage::new("owner-1"));
        let partition = storage.create_partition("t1", 0);
        partition.set_range(PhysicalPosition::new(0, 0), PhysicalPosition::new(9, 0));
        let manager = manager_over(storage.clone());

        let position = PhysicalPosition::new(5, 12);
        manager.commit("g1", "t1", 0, encode(position).unwrap());
        manager.commit("sys/compaction", "t1", 0, 0);

        let report = manager.persist().await;
        assert_eq!(
            report,
            PersistReport {
                persisted: 1,
                failed: 0,
                skipped_system: 1,
            }
        );
        let cursor = partition.cursor("g1").unwrap();
        assert_eq!(cursor.read_position(), position);
        assert!(partition.cursor("sys/compaction").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_is_best_effort() {
        let storage = Arc::new(LocalStorage::new("owner-1"));
        for partition in 0..3 {
            storage.create_partition("t1", partition);
        }
        storage.set_partition_unavailable("t1", 1, true);
        let manager = manager_over(storage.clone());
        for partition in 0..3 {
            manager.commit("g1", "t1", partition, encode(PhysicalPosition::new(1, 1)).unwrap());
        }

        let report = manager.persist().await;
        assert_eq!(report.persisted, 2);
        assert_eq!(report.failed, 1);
        assert!(report.into_result().is_err());

        for partition in [0, 2] {
            let local = storage.partition("t1", partition).unwrap();
            assert_eq!(
                local.cursor("g1").unwrap().read_position(),
                PhysicalPosition::new(1, 1)
            );
        }
        assert!(storage.partition("t1", 1).unwrap().cursor("g1").is_none());
        // the table is untouched by a failed pass
        assert_eq!(manager.query_all("g1", "t1").len(), 3);
    }
}
