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

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::offset::{TopicKey, TopicPartition};
use crate::storage::{PartitionRef, StorageSubsystem};
use crate::utils::SingleFlight;
use crate::{AppError, AppResult};

use super::backoff::{Backoff, BackoffConfig, Clock, SystemClock};

/// Why a background resolution gave up. Shared by every waiter of the
/// flight, hence `Clone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    Exhausted { attempts: u32 },
    NotFound,
}

type Resolution = Result<PartitionRef, ResolveFailure>;

/// Lookup-accelerating cache of partition objects, keyed by topic then
/// partition.
///
/// Entries are only ever re-derivable copies of what the store serves, so
/// dropping one loses nothing. Misses are resolved in the background with at
/// most one lookup per partition in flight; callers wait a bounded time.
#[derive(Debug)]
pub struct PartitionCache {
    storage: Arc<dyn StorageSubsystem>,
    handles: DashMap<TopicKey, DashMap<i32, PartitionRef>>,
    // bumped by invalidation; a flight started under an older value does not cache
    generations: DashMap<TopicKey, u64>,
    in_flight: Arc<SingleFlight<TopicPartition, Resolution>>,
    backoff: BackoffConfig,
    caller_wait: Duration,
    clock: Arc<dyn Clock>,
}

impl PartitionCache {
    pub fn new(
        storage: Arc<dyn StorageSubsystem>,
        backoff: BackoffConfig,
        caller_wait: Duration,
    ) -> Self {
        Self::with_clock(storage, backoff, caller_wait, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn StorageSubsystem>,
        backoff: BackoffConfig,
        caller_wait: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            handles: DashMap::new(),
            generations: DashMap::new(),
            in_flight: SingleFlight::new(),
            backoff,
            caller_wait,
            clock,
        }
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<PartitionRef> {
        self.handles
            .get(topic)
            .and_then(|partitions| partitions.get(&partition).map(|handle| handle.clone()))
    }

    /// Returns the cached handle, resolving it against the store on a miss.
    ///
    /// Fails with [`AppError::ResolutionTimeout`] when no handle is available
    /// within the caller wait. The lookup keeps running after that and will
    /// fill the cache for later callers if it succeeds.
    pub async fn resolve(self: &Arc<Self>, topic: &str, partition: i32) -> AppResult<PartitionRef> {
        if let Some(handle) = self.get(topic, partition) {
            return Ok(handle);
        }

        let topic_partition = TopicPartition::new(topic, partition);
        let flight = {
            let cache = Arc::clone(self);
            let key = topic_partition.clone();
            self.in_flight
                .join(topic_partition.clone(), move || async move {
                    cache.resolve_with_retry(key).await
                })
        };

        match tokio::time::timeout(self.caller_wait, flight.wait()).await {
            Ok(Some(Ok(handle))) => Ok(handle),
            Ok(Some(Err(ResolveFailure::NotFound))) => {
                Err(AppError::UnknownPartition(topic_partition.to_string()))
            }
            Ok(Some(Err(ResolveFailure::Exhausted { attempts }))) => {
                warn!(
                    monotonic_counter.resolution_timeouts = 1_u64,
                    "lookup partition {} gave up after {} retries",
                    topic_partition,
                    attempts
                );
                Err(self.timeout_error(topic_partition))
            }
            Ok(None) | Err(_) => {
                warn!(
                    monotonic_counter.resolution_timeouts = 1_u64,
                    "lookup partition {} not finished within {} ms",
                    topic_partition,
                    self.caller_wait.as_millis()
                );
                Err(self.timeout_error(topic_partition))
            }
        }
    }

    async fn resolve_with_retry(&self, topic_partition: TopicPartition) -> Resolution {
        // a flight that finished just before ours registered may have filled it
        if let Some(handle) = self.get(topic_partition.topic.as_str(), topic_partition.partition) {
            return Ok(handle);
        }

        let generation = self.generation(&topic_partition.topic);
        let started = self.clock.now();
        let deadline = started + self.backoff.mandatory_stop;
        let mut backoff = Backoff::new(self.backoff, Arc::clone(&self.clock));
        loop {
            let budget = deadline
                .saturating_duration_since(self.clock.now())
                .max(self.backoff.initial);
            let attempt = match tokio::time::timeout(budget, self.lookup(&topic_partition)).await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::StorageUnavailable(format!(
                    "lookup of {} not answered within {} ms",
                    topic_partition,
                    budget.as_millis()
                ))),
            };
            match attempt {
                Ok(handle) => {
                    let handle = self.insert_resolved(&topic_partition, handle, generation);
                    let latency = self.clock.now().saturating_duration_since(started);
                    debug!(
                        histogram.resolution_latency_ms = latency.as_millis() as u64,
                        "resolved partition {} after {} retries",
                        topic_partition,
                        backoff.attempts()
                    );
                    return Ok(handle);
                }
                Err(AppError::UnknownPartition(_)) => {
                    warn!("partition {} does not exist in the store", topic_partition);
                    return Err(ResolveFailure::NotFound);
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "lookup partition {} failed: {}, will retry in {} ms",
                            topic_partition,
                            e,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(
                            "lookup partition {} failed: {}, retried too many times",
                            topic_partition, e
                        );
                        return Err(ResolveFailure::Exhausted {
                            attempts: backoff.attempts(),
                        });
                    }
                },
            }
        }
    }

    async fn lookup(&self, topic_partition: &TopicPartition) -> AppResult<PartitionRef> {
        let owner = self.storage.locate_owner(topic_partition).await?;
        trace!("partition {} is owned by {}", topic_partition, owner);
        self.storage
            .get_partition(&owner, topic_partition)
            .await?
            .ok_or_else(|| AppError::UnknownPartition(topic_partition.to_string()))
    }

    fn generation(&self, topic: &TopicKey) -> u64 {
        self.generations
            .get(topic)
            .map(|generation| *generation)
            .unwrap_or(0)
    }

    // Holds the generation entry while inserting, so an invalidation either
    // happens before (and is seen) or after (and removes the handle).
    fn insert_resolved(
        &self,
        topic_partition: &TopicPartition,
        handle: PartitionRef,
        generation: u64,
    ) -> PartitionRef {
        let current = self
            .generations
            .entry(topic_partition.topic.clone())
            .or_insert(0);
        if *current != generation {
            debug!(
                "partition {} invalidated while resolving, not cached",
                topic_partition
            );
            return handle;
        }
        self.insert_if_absent(topic_partition, handle)
    }

    fn bump_generation(&self, topic: &str) -> RefMut<'_, TopicKey, u64> {
        let mut generation = self.generations.entry(TopicKey::new(topic)).or_insert(0);
        *generation += 1;
        generation
    }

    /// First writer wins: returns the handle that ends up cached, which is
    /// `handle` only if nothing was cached before.
    pub fn insert_if_absent(
        &self,
        topic_partition: &TopicPartition,
        handle: PartitionRef,
    ) -> PartitionRef {
        let insert = |partitions: &DashMap<i32, PartitionRef>| {
            partitions
                .entry(topic_partition.partition)
                .or_insert(handle)
                .value()
                .clone()
        };
        if let Some(partitions) = self.handles.get(&topic_partition.topic) {
            return insert(partitions.value());
        }
        let partitions = self
            .handles
            .entry(topic_partition.topic.clone())
            .or_default();
        insert(partitions.value())
    }

    /// Atomically replaces the cached handle, e.g. after the store reloaded
    /// the partition object.
    pub fn refresh(&self, topic_partition: &TopicPartition, handle: PartitionRef) {
        self.handles
            .entry(topic_partition.topic.clone())
            .or_default()
            .insert(topic_partition.partition, handle);
        debug!("refreshed cached partition {}", topic_partition);
    }

    /// Drops one handle; the next `resolve` looks it up again.
    pub fn invalidate(&self, topic: &str, partition: i32) -> Option<PartitionRef> {
        let _generation = self.bump_generation(topic);
        let removed = self
            .handles
            .get(topic)
            .and_then(|partitions| partitions.remove(&partition).map(|(_, handle)| handle));
        self.handles
            .remove_if(topic, |_, partitions| partitions.is_empty());
        removed
    }

    pub fn invalidate_topic(&self, topic: &str) -> usize {
        let _generation = self.bump_generation(topic);
        self.handles
            .remove(topic)
            .map(|(_, partitions)| partitions.len())
            .unwrap_or(0)
    }

    pub fn cached_partitions(&self, topic: &str) -> Vec<i32> {
        let mut partitions: Vec<i32> = self
            .handles
            .get(topic)
            .map(|partitions| partitions.iter().map(|entry| *entry.key()).collect())
            .unwrap_or_default();
        partitions.sort_unstable();
        partitions
    }

    pub fn is_resolving(&self, topic: &str, partition: i32) -> bool {
        self.in_flight
            .is_in_flight(&TopicPartition::new(topic, partition))
    }

    fn timeout_error(&self, topic_partition: TopicPartition) -> AppError {
        AppError::ResolutionTimeout {
            topic: topic_partition.topic.as_str().to_string(),
            partition: topic_partition.partition,
        }
    }
}
