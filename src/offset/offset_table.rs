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
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::{GroupTopicKey, LogicalOffset};

/// Plain copy of the table, used for restore at startup and for tests.
pub type OffsetSnapshot = HashMap<GroupTopicKey, HashMap<i32, LogicalOffset>>;

/// Committed offsets keyed by (group, topic) then partition.
///
/// Writers touch the inner map while holding a read guard on the outer
/// shard, so an entry removed by the sweeper can never swallow a commit that
/// raced with it: the removal waits for the guard and then re-checks. Inner
/// maps are only grown or updated in place, never swapped out.
#[derive(Debug, Default)]
pub struct OffsetTable {
    offsets: DashMap<GroupTopicKey, DashMap<i32, LogicalOffset>>,
    regressions: AtomicU64,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the committed offset. A value lower than the previous one is
    /// still applied (consumers may rewind) but reported as a regression.
    pub fn commit(&self, group: &str, topic: &str, partition: i32, offset: LogicalOffset) {
        let key = GroupTopicKey::new(group, topic);
        let previous = self.with_partitions(key.clone(), |partitions| {
            partitions.insert(partition, offset)
        });

        match previous {
            Some(previous) if offset < previous => {
                self.regressions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    monotonic_counter.offset_regressions = 1_u64,
                    "update consumer offset less than stored one, key={}, partition={}, request_offset={}, stored_offset={}",
                    key,
                    partition,
                    offset,
                    previous
                );
            }
            _ => trace!("commit offset {} for {}:{}", offset, key, partition),
        }
    }

    pub fn query(&self, group: &str, topic: &str, partition: i32) -> Option<LogicalOffset> {
        let key = GroupTopicKey::new(group, topic);
        self.offsets
            .get(&key)
            .and_then(|partitions| partitions.get(&partition).map(|offset| *offset))
    }

    /// Point-in-time copy of one group's offsets on a topic; empty if the
    /// group never committed there.
    pub fn query_all(&self, group: &str, topic: &str) -> HashMap<i32, LogicalOffset> {
        self.partitions(&GroupTopicKey::new(group, topic))
            .unwrap_or_default()
    }

    pub fn partitions(&self, key: &GroupTopicKey) -> Option<HashMap<i32, LogicalOffset>> {
        self.offsets.get(key).map(|partitions| {
            partitions
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect()
        })
    }

    /// Copies the source group's offsets on `topic` into the destination
    /// group, overwriting overlapping partitions. No-op without a source.
    pub fn clone_group(&self, source_group: &str, dest_group: &str, topic: &str) {
        let Some(source) = self.partitions(&GroupTopicKey::new(source_group, topic)) else {
            debug!(
                "clone offsets skipped, group {} has no offsets on {}",
                source_group, topic
            );
            return;
        };
        self.with_partitions(GroupTopicKey::new(dest_group, topic), |partitions| {
            for (partition, offset) in &source {
                partitions.insert(*partition, *offset);
            }
        });
        debug!(
            "cloned {} partition offsets of {} from group {} to {}",
            source.len(),
            topic,
            source_group,
            dest_group
        );
    }

    /// Records `offset` only if nothing is stored for the partition yet.
    /// Returns whether it was recorded.
    pub fn seed_if_absent(&self, key: &GroupTopicKey, partition: i32, offset: LogicalOffset) -> bool {
        self.with_partitions(key.clone(), |partitions| {
            let mut inserted = false;
            partitions.entry(partition).or_insert_with(|| {
                inserted = true;
                offset
            });
            inserted
        })
    }

    pub fn list_topics_for_group(&self, group: &str) -> BTreeSet<String> {
        self.offsets
            .iter()
            .filter(|entry| entry.key().group == group)
            .map(|entry| entry.key().topic.as_str().to_string())
            .collect()
    }

    pub fn list_groups_for_topic(&self, topic: &str) -> BTreeSet<String> {
        self.offsets
            .iter()
            .filter(|entry| entry.key().topic.as_str() == topic)
            .map(|entry| entry.key().group.clone())
            .collect()
    }

    /// Offsets of every group committed on `topic`, except `excluded_groups`.
    pub fn offsets_for_topic(
        &self,
        topic: &str,
        excluded_groups: &[&str],
    ) -> Vec<(String, HashMap<i32, LogicalOffset>)> {
        self.keys()
            .into_iter()
            .filter(|key| key.topic.as_str() == topic)
            .filter(|key| !excluded_groups.contains(&key.group.as_str()))
            .filter_map(|key| self.partitions(&key).map(|offsets| (key.group, offsets)))
            .collect()
    }

    pub fn keys(&self) -> Vec<GroupTopicKey> {
        self.offsets.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn remove(&self, group: &str, topic: &str) -> Option<HashMap<i32, LogicalOffset>> {
        self.offsets
            .remove(&GroupTopicKey::new(group, topic))
            .map(|(_, partitions)| partitions.into_iter().collect())
    }

    /// Drops every topic entry of `group`; returns how many were dropped.
    pub fn delete_group(&self, group: &str) -> usize {
        let before = self.offsets.len();
        self.offsets.retain(|key, _| key.group != group);
        let removed = before.saturating_sub(self.offsets.len());
        debug!("deleted {} topic offset entries of group {}", removed, group);
        removed
    }

    /// Removes the entry only if it still holds exactly `expected`, so a
    /// commit that landed after the caller's check keeps the entry alive.
    pub fn remove_if_unchanged(
        &self,
        key: &GroupTopicKey,
        expected: &HashMap<i32, LogicalOffset>,
    ) -> bool {
        self.offsets
            .remove_if(key, |_, partitions| {
                partitions.len() == expected.len()
                    && partitions
                        .iter()
                        .all(|entry| expected.get(entry.key()) == Some(entry.value()))
            })
            .is_some()
    }

    pub fn snapshot(&self) -> OffsetSnapshot {
        self.offsets
            .iter()
            .map(|entry| {
                let partitions = entry
                    .value()
                    .iter()
                    .map(|p| (*p.key(), *p.value()))
                    .collect();
                (entry.key().clone(), partitions)
            })
            .collect()
    }

    /// Replaces the whole table. Only meant for startup, before any commit.
    pub fn restore(&self, snapshot: OffsetSnapshot) {
        self.offsets.clear();
        for (key, partitions) in snapshot {
            self.offsets.insert(key, partitions.into_iter().collect());
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Number of regressing commits seen since startup.
    pub fn regressions(&self) -> u64 {
        self.regressions.load(Ordering::Relaxed)
    }

    fn with_partitions<R>(
        &self,
        key: GroupTopicKey,
        f: impl FnOnce(&DashMap<i32, LogicalOffset>) -> R,
    ) -> R {
        // fast path: shared guard on the outer shard
        if let Some(partitions) = self.offsets.get(&key) {
            return f(partitions.value());
        }
        let partitions = self.offsets.entry(key).or_default();
        f(partitions.value())
    }
}
