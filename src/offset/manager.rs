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

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::partition::PartitionCache;
use crate::storage::{PartitionRef, SubscriptionRegistry};
use crate::AppResult;

use super::codec::encode;
use super::{GroupTopicKey, LogicalOffset, OffsetSnapshot, OffsetTable};

/// Offset bookkeeping for one bridge instance: the committed offset table,
/// the partition cache it consults for retained ranges, and the registry
/// that says which groups are still consuming.
///
/// Request handlers use the table operations; the sweeper and persist
/// passes live in their own files.
#[derive(Debug)]
pub struct OffsetManager {
    pub(super) table: Arc<OffsetTable>,
    pub(super) cache: Arc<PartitionCache>,
    pub(super) subscriptions: Arc<dyn SubscriptionRegistry>,
    system_group_prefixes: Vec<String>,
    // one persist pass at a time
    pub(super) persist_lock: tokio::sync::Mutex<()>,
}

impl OffsetManager {
    pub fn new(
        cache: Arc<PartitionCache>,
        subscriptions: Arc<dyn SubscriptionRegistry>,
        system_group_prefixes: Vec<String>,
    ) -> Self {
        Self {
            table: Arc::new(OffsetTable::new()),
            cache,
            subscriptions,
            system_group_prefixes,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn table(&self) -> &Arc<OffsetTable> {
        &self.table
    }

    pub fn cache(&self) -> &Arc<PartitionCache> {
        &self.cache
    }

    pub fn is_system_group(&self, group: &str) -> bool {
        self.system_group_prefixes
            .iter()
            .any(|prefix| group.starts_with(prefix.as_str()))
    }

    pub fn commit(&self, group: &str, topic: &str, partition: i32, offset: LogicalOffset) {
        self.table.commit(group, topic, partition, offset);
    }

    pub fn query(&self, group: &str, topic: &str, partition: i32) -> Option<LogicalOffset> {
        self.table.query(group, topic, partition)
    }

    pub fn query_all(&self, group: &str, topic: &str) -> HashMap<i32, LogicalOffset> {
        self.table.query_all(group, topic)
    }

    pub fn clone_group(&self, source_group: &str, dest_group: &str, topic: &str) {
        self.table.clone_group(source_group, dest_group, topic);
    }

    pub fn list_topics_for_group(&self, group: &str) -> BTreeSet<String> {
        self.table.list_topics_for_group(group)
    }

    pub fn list_groups_for_topic(&self, topic: &str) -> BTreeSet<String> {
        self.table.list_groups_for_topic(topic)
    }

    /// Administrative removal of every offset a group has committed.
    pub fn delete_group(&self, group: &str) -> usize {
        let removed = self.table.delete_group(group);
        info!("deleted group {}, {} topic entries dropped", group, removed);
        removed
    }

    pub fn remove(&self, group: &str, topic: &str) -> Option<HashMap<i32, LogicalOffset>> {
        self.table.remove(group, topic)
    }

    pub fn snapshot(&self) -> OffsetSnapshot {
        self.table.snapshot()
    }

    pub fn restore(&self, snapshot: OffsetSnapshot) {
        info!("restoring {} offset entries", snapshot.len());
        self.table.restore(snapshot);
    }

    /// Logical offset of the earliest retained record.
    pub async fn min_offset(&self, topic: &str, partition: i32) -> AppResult<LogicalOffset> {
        let handle = self.cache.resolve(topic, partition).await?;
        encode(handle.first_position()?)
    }

    /// Logical offset of the last appended record.
    pub async fn max_offset(&self, topic: &str, partition: i32) -> AppResult<LogicalOffset> {
        let handle = self.cache.resolve(topic, partition).await?;
        encode(handle.last_position()?)
    }

    /// Per partition, the lowest offset still needed by any group consuming
    /// `topic`, ignoring `excluded_groups`. Offsets already below the
    /// retained minimum point at deleted data and do not count. An empty map
    /// means no group constrains retention on the topic.
    pub async fn query_min_across_groups(
        &self,
        topic: &str,
        excluded_groups: &[&str],
    ) -> HashMap<i32, LogicalOffset> {
        let mut retained_min: HashMap<i32, Option<LogicalOffset>> = HashMap::new();
        let mut watermarks = HashMap::new();

        for (group, offsets) in self.table.offsets_for_topic(topic, excluded_groups) {
            for (partition, offset) in offsets {
                let min = match retained_min.get(&partition).copied() {
                    Some(min) => min,
                    None => {
                        let min = match self.min_offset(topic, partition).await {
                            Ok(min) => Some(min),
                            Err(e) => {
                                // keep the offset: a low watermark is the safe side
                                debug!(
                                    "retained minimum of {}-{} unknown: {}",
                                    topic, partition, e
                                );
                                None
                            }
                        };
                        retained_min.insert(partition, min);
                        min
                    }
                };
                if matches!(min, Some(min) if offset < min) {
                    debug!(
                        "ignore stale offset {} of group {} on {}-{}",
                        offset, group, topic, partition
                    );
                    continue;
                }
                watermarks
                    .entry(partition)
                    .and_modify(|current: &mut LogicalOffset| *current = (*current).min(offset))
                    .or_insert(offset);
            }
        }
        watermarks
    }

    /// Makes a partition object loaded by the broker known to the bridge.
    ///
    /// The handle is cached (an already cached one wins) and every durable
    /// cursor of a non-system group on it seeds the table, unless the group
    /// already committed on that partition.
    pub fn register_partition(&self, handle: PartitionRef) -> PartitionRef {
        let topic_partition = handle.topic_partition().clone();
        let handle = self.cache.insert_if_absent(&topic_partition, handle);

        for (group, position) in handle.cursor_positions() {
            if self.is_system_group(&group) {
                continue;
            }
            let offset = match encode(position) {
                Ok(offset) => offset,
                Err(e) => {
                    warn!(
                        "cursor of group {} on {} not seeded: {}",
                        group, topic_partition, e
                    );
                    continue;
                }
            };
            let key = GroupTopicKey::new(group, topic_partition.topic.as_str());
            if self
                .table
                .seed_if_absent(&key, topic_partition.partition, offset)
            {
                debug!(
                    "seeded offset {} for {} partition {} from its cursor",
                    offset, key, topic_partition.partition
                );
            }
        }
        handle
    }

    /// The partition was unloaded; committed offsets stay.
    pub fn unregister_partition(&self, topic: &str, partition: i32) {
        if self.cache.invalidate(topic, partition).is_some() {
            debug!("unregistered partition {}-{}", topic, partition);
        }
    }

    pub fn unregister_topic(&self, topic: &str) {
        let dropped = self.cache.invalidate_topic(topic);
        debug!("unregistered topic {}, {} partitions dropped", topic, dropped);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::offset::PhysicalPosition;
    use crate::partition::BackoffConfig;
    use crate::storage::{CursorHandle, LocalStorage, LocalSubscriptions, PartitionHandle};

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

    fn offset(segment_id: i64, entry_index: i64) -> LogicalOffset {
        encode(PhysicalPosition::new(segment_id, entry_index)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_and_max_offset() {
        let storage = Arc::new(LocalStorage::new("owner-1"));
        let partition = storage.create_partition("t1", 0);
        partition.set_range(PhysicalPosition::new(2, 5), PhysicalPosition::new(3, 9));
        let manager = manager_over(storage);

        assert_eq!(manager.min_offset("t1", 0).await.unwrap(), offset(2, 5));
        assert_eq!(manager.max_offset("t1", 0).await.unwrap(), offset(3, 9));
        assert!(manager.min_offset("t1", 1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_min_across_groups() {
        let storage = Arc::new(LocalStorage::new("owner-1"));
        for partition in 0..2 {
            storage
                .create_partition("t1", partition)
                .set_range(PhysicalPosition::new(1, 0), PhysicalPosition::new(9, 0));
        }
        let manager = manager_over(storage);

        manager.commit("g1", "t1", 0, offset(5, 0));
        manager.commit("g2", "t1", 0, offset(3, 0));
        manager.commit("g1", "t1", 1, offset(4, 0));
        // below the retained minimum: garbage, must not pull the watermark down
        manager.commit("g3", "t1", 1, offset(0, 7));
        manager.commit("g4", "t2", 0, offset(1, 0));

        let watermarks = manager.query_min_across_groups("t1", &[]).await;
        assert_eq!(
            watermarks,
            HashMap::from([(0, offset(3, 0)), (1, offset(4, 0))])
        );

        let watermarks = manager.query_min_across_groups("t1", &["g2"]).await;
        assert_eq!(
            watermarks,
            HashMap::from([(0, offset(5, 0)), (1, offset(4, 0))])
        );

        // every group excluded: nothing constrains retention
        let watermarks = manager
            .query_min_across_groups("t1", &["g1", "g2", "g3"])
            .await;
        assert!(watermarks.is_empty());
        assert_eq!(manager.list_groups_for_topic("t1").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_min_keeps_offsets_of_unresolvable_partitions() {
        let storage = Arc::new(LocalStorage::new("owner-1"));
        storage.create_partition("t1", 0);
        storage.set_partition_unavailable("t1", 0, true);
        let manager = manager_over(storage);

        manager.commit("g1", "t1", 0, 17);
        let watermarks = manager.query_min_across_groups("t1", &[]).await;
        assert_eq!(watermarks, HashMap::from([(0, 17)]));
    }

    #[tokio::test]
    async fn test_register_partition_seeds_from_cursors() {
        let storage = Arc::new(LocalStorage::new("owner-1"));
        let partition = storage.create_partition("t1", 0);
        partition.set_range(PhysicalPosition::new(0, 0), PhysicalPosition::new(8, 0));
        for (group, position) in [
            ("app", PhysicalPosition::new(6, 1)),
            ("sys/internal", PhysicalPosition::new(7, 0)),
            ("committed", PhysicalPosition::new(2, 2)),
        ] {
            partition
                .get_or_create_cursor(group)
                .await
                .unwrap()
                .reset_to(position)
                .await
                .unwrap();
        }
        let manager = manager_over(storage.clone());
        manager.commit("committed", "t1", 0, offset(5, 5));

        let cached = manager.register_partition(partition.clone());
        assert!(manager.cache().get("t1", 0).is_some());
        assert_eq!(cached.topic_partition(), partition.topic_partition());

        assert_eq!(manager.query("app", "t1", 0), Some(offset(6, 1)));
        assert_eq!(manager.query("sys/internal", "t1", 0), None);
        // an existing commit is never overridden by the cursor
        assert_eq!(manager.query("committed", "t1", 0), Some(offset(5, 5)));

        manager.unregister_partition("t1", 0);
        assert!(manager.cache().get("t1", 0).is_none());
        assert_eq!(manager.query("app", "t1", 0), Some(offset(6, 1)));
        assert_eq!(storage.lookup_count(), 0);

        manager.register_partition(partition);
        manager.unregister_topic("t1");
        assert!(manager.cache().cached_partitions("t1").is_empty());
    }

    #[test]
    fn test_delete_group_and_views() {
        let manager = manager_over(Arc::new(LocalStorage::new("owner-1")));
        manager.commit("g1", "t1", 0, 100);
        manager.commit("g1", "t1", 1, 200);
        manager.clone_group("g1", "g2", "t1");
        assert_eq!(manager.query_all("g2", "t1"), HashMap::from([(0, 100), (1, 200)]));
        assert_eq!(manager.list_topics_for_group("g2").len(), 1);

        assert_eq!(manager.delete_group("g1"), 1);
        assert!(manager.query_all("g1", "t1").is_empty());
        assert!(manager.is_system_group("sys/x"));
        assert!(!manager.is_system_group("g1"));
    }
}
