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

//! In-process store used by the standalone binary and by tests.
//!
//! Partitions keep only their retained range and their cursors, no record
//! data. Cursors survive restarts through a [`CursorCheckpointFile`]
//! written on [`LocalStorage::flush`]. Lookups can be slowed down or made to
//! fail to exercise the retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::offset::{GroupTopicKey, PhysicalPosition, TopicPartition};
use crate::{AppError, AppResult};

use super::cursor_checkpoint::{CursorCheckpointFile, CursorPoints};
use super::{
    BoxFuture, CursorHandle, CursorRef, OwnerAddress, PartitionHandle, PartitionRef,
    StorageSubsystem, SubscriptionRegistry,
};

#[derive(Debug)]
pub struct LocalCursor {
    group: String,
    position: Mutex<PhysicalPosition>,
}

impl CursorHandle for LocalCursor {
    fn group(&self) -> &str {
        &self.group
    }

    fn read_position(&self) -> PhysicalPosition {
        *self.position.lock()
    }

    fn reset_to(&self, position: PhysicalPosition) -> BoxFuture<'_, AppResult<()>> {
        Box::pin(async move {
            *self.position.lock() = position;
            trace!("cursor {} reset to {}", self.group, position);
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RetainedRange {
    first: PhysicalPosition,
    last: PhysicalPosition,
}

#[derive(Debug)]
pub struct LocalPartition {
    topic_partition: TopicPartition,
    range: Mutex<RetainedRange>,
    cursors: DashMap<String, Arc<LocalCursor>>,
}

impl LocalPartition {
    pub fn new(topic_partition: TopicPartition) -> Self {
        Self {
            topic_partition,
            range: Mutex::new(RetainedRange {
                first: PhysicalPosition::default(),
                last: PhysicalPosition::default(),
            }),
            cursors: DashMap::new(),
        }
    }

    /// Appends one entry to the current segment and returns its position.
    pub fn append(&self) -> PhysicalPosition {
        let mut range = self.range.lock();
        range.last.entry_index += 1;
        range.last
    }

    /// Closes the current segment; the next append starts a new one.
    pub fn roll_segment(&self) -> PhysicalPosition {
        let mut range = self.range.lock();
        range.last = PhysicalPosition::new(range.last.segment_id + 1, 0);
        range.last
    }

    /// Drops everything before `first`, as retention would.
    pub fn trim_to(&self, first: PhysicalPosition) {
        let mut range = self.range.lock();
        range.first = first.min(range.last);
    }

    pub fn set_range(&self, first: PhysicalPosition, last: PhysicalPosition) {
        *self.range.lock() = RetainedRange { first, last };
    }

    pub fn cursor(&self, group: &str) -> Option<Arc<LocalCursor>> {
        self.cursors.get(group).map(|cursor| cursor.clone())
    }

    fn open_cursor(&self, group: &str, position: PhysicalPosition) -> Arc<LocalCursor> {
        self.cursors
            .entry(group.to_string())
            .or_insert_with(|| {
                Arc::new(LocalCursor {
                    group: group.to_string(),
                    position: Mutex::new(position),
                })
            })
            .clone()
    }
}

impl PartitionHandle for LocalPartition {
    fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    fn first_position(&self) -> AppResult<PhysicalPosition> {
        Ok(self.range.lock().first)
    }

    fn last_position(&self) -> AppResult<PhysicalPosition> {
        Ok(self.range.lock().last)
    }

    fn cursor_positions(&self) -> Vec<(String, PhysicalPosition)> {
        self.cursors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().read_position()))
            .collect()
    }

    fn get_or_create_cursor<'a>(&'a self, group: &'a str) -> BoxFuture<'a, AppResult<CursorRef>> {
        Box::pin(async move {
            // new cursors start at the tail, like a subscription created "latest"
            let last = self.range.lock().last;
            let cursor: CursorRef = self.open_cursor(group, last);
            Ok(cursor)
        })
    }
}

#[derive(Debug)]
pub struct LocalStorage {
    owner: OwnerAddress,
    partitions: DashMap<TopicPartition, Arc<LocalPartition>>,
    unavailable: DashSet<TopicPartition>,
    // cursors loaded from the checkpoint whose partition is not created yet
    pending_cursors: Mutex<CursorPoints>,
    checkpoint: Option<CursorCheckpointFile>,
    lookup_delay: Mutex<Duration>,
    failing_lookups: AtomicUsize,
    lookup_count: AtomicUsize,
}

impl LocalStorage {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: OwnerAddress(owner.into()),
            partitions: DashMap::new(),
            unavailable: DashSet::new(),
            pending_cursors: Mutex::new(HashMap::new()),
            checkpoint: None,
            lookup_delay: Mutex::new(Duration::ZERO),
            failing_lookups: AtomicUsize::new(0),
            lookup_count: AtomicUsize::new(0),
        }
    }

    /// Storage whose cursors are loaded from, and flushed to, `checkpoint_path`.
    pub async fn open(owner: impl Into<String>, checkpoint_path: &str) -> AppResult<Self> {
        let checkpoint = CursorCheckpointFile::new(checkpoint_path);
        let points = checkpoint.read_checkpoints().await?;
        info!(
            "loaded {} cursors from checkpoint {}",
            points.len(),
            checkpoint_path
        );
        let mut storage = Self::new(owner);
        storage.pending_cursors = Mutex::new(points);
        storage.checkpoint = Some(checkpoint);
        Ok(storage)
    }

    /// Creates the partition (or returns the existing one), attaching any
    /// cursors the checkpoint holds for it.
    pub fn create_partition(&self, topic: &str, partition: i32) -> Arc<LocalPartition> {
        let topic_partition = TopicPartition::new(topic, partition);
        let local = self
            .partitions
            .entry(topic_partition.clone())
            .or_insert_with(|| Arc::new(LocalPartition::new(topic_partition.clone())))
            .clone();

        let mut pending = self.pending_cursors.lock();
        let restored: Vec<_> = pending
            .keys()
            .filter(|(_, tp)| *tp == topic_partition)
            .cloned()
            .collect();
        for key in restored {
            if let Some(position) = pending.remove(&key) {
                // the restored cursor may sit past an empty partition's tail
                let mut range = local.range.lock();
                range.last = range.last.max(position);
                drop(range);
                local.open_cursor(&key.0, position);
            }
        }
        local
    }

    pub fn partition(&self, topic: &str, partition: i32) -> Option<Arc<LocalPartition>> {
        self.partitions
            .get(&TopicPartition::new(topic, partition))
            .map(|local| local.clone())
    }

    pub fn delete_partition(&self, topic: &str, partition: i32) -> bool {
        self.partitions
            .remove(&TopicPartition::new(topic, partition))
            .is_some()
    }

    /// Writes all cursors to the checkpoint file, if one is configured.
    pub async fn flush(&self) -> AppResult<()> {
        let Some(checkpoint) = &self.checkpoint else {
            return Ok(());
        };
        let mut points: CursorPoints = self.pending_cursors.lock().clone();
        for partition in self.partitions.iter() {
            for (group, position) in partition.cursor_positions() {
                points.insert((group, partition.key().clone()), position);
            }
        }
        checkpoint.write_checkpoints(&points).await?;
        debug!("flushed {} cursors", points.len());
        Ok(())
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock() = delay;
    }

    /// The next `count` owner lookups fail with a transient error.
    pub fn fail_next_lookups(&self, count: usize) {
        self.failing_lookups.store(count, Ordering::SeqCst);
    }

    /// While set, lookups for this partition fail with a transient error.
    pub fn set_partition_unavailable(&self, topic: &str, partition: i32, unavailable: bool) {
        let topic_partition = TopicPartition::new(topic, partition);
        if unavailable {
            self.unavailable.insert(topic_partition);
        } else {
            self.unavailable.remove(&topic_partition);
        }
    }

    pub fn lookup_count(&self) -> usize {
        self.lookup_count.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl StorageSubsystem for LocalStorage {
    fn locate_owner<'a>(
        &'a self,
        topic_partition: &'a TopicPartition,
    ) -> BoxFuture<'a, AppResult<OwnerAddress>> {
        Box::pin(async move {
            self.lookup_count.fetch_add(1, Ordering::SeqCst);
            let delay = *self.lookup_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.take_injected_failure() || self.unavailable.contains(topic_partition) {
                return Err(AppError::StorageUnavailable(format!(
                    "lookup of {} failed",
                    topic_partition
                )));
            }
            Ok(self.owner.clone())
        })
    }

    fn get_partition<'a>(
        &'a self,
        owner: &'a OwnerAddress,
        topic_partition: &'a TopicPartition,
    ) -> BoxFuture<'a, AppResult<Option<PartitionRef>>> {
        Box::pin(async move {
            if *owner != self.owner {
                return Err(AppError::StorageUnavailable(format!(
                    "{} is not served by {}",
                    topic_partition, owner
                )));
            }
            Ok(self
                .partitions
                .get(topic_partition)
                .map(|local| -> PartitionRef { local.clone() }))
        })
    }
}

/// Registry of live (group, topic) subscriptions.
#[derive(Debug, Default)]
pub struct LocalSubscriptions {
    active: DashSet<GroupTopicKey>,
}

impl LocalSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, group: &str, topic: &str) {
        self.active.insert(GroupTopicKey::new(group, topic));
    }

    pub fn unsubscribe(&self, group: &str, topic: &str) -> bool {
        self.active
            .remove(&GroupTopicKey::new(group, topic))
            .is_some()
    }
}

impl SubscriptionRegistry for LocalSubscriptions {
    fn has_active_subscription(&self, group: &str, topic: &str) -> bool {
        self.active.contains(&GroupTopicKey::new(group, topic))
    }
}
