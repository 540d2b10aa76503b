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

//! Interfaces of the systems the bridge sits between.
//!
//! The log store owns partitions and their durable consumption cursors; the
//! subscription registry knows which groups are currently consuming. Both
//! are external, and [`local`] provides an in-process implementation of
//! each.

mod cursor_checkpoint;
mod local;

pub use cursor_checkpoint::CursorCheckpointFile;
pub use cursor_checkpoint::CursorPoints;
pub use local::{LocalCursor, LocalPartition, LocalStorage, LocalSubscriptions};

use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::offset::{PhysicalPosition, TopicPartition};
use crate::AppResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type PartitionRef = Arc<dyn PartitionHandle>;
pub type CursorRef = Arc<dyn CursorHandle>;

/// Address of the node that owns a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerAddress(pub String);

impl Display for OwnerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait StorageSubsystem: Send + Sync + Debug + 'static {
    /// Which node serves the partition. May fail transiently.
    fn locate_owner<'a>(
        &'a self,
        topic_partition: &'a TopicPartition,
    ) -> BoxFuture<'a, AppResult<OwnerAddress>>;

    /// Loads the partition object from its owner; `Ok(None)` means the
    /// owner says the partition does not exist.
    fn get_partition<'a>(
        &'a self,
        owner: &'a OwnerAddress,
        topic_partition: &'a TopicPartition,
    ) -> BoxFuture<'a, AppResult<Option<PartitionRef>>>;
}

/// A loaded partition of the log store.
pub trait PartitionHandle: Send + Sync + Debug {
    fn topic_partition(&self) -> &TopicPartition;

    /// Earliest position still readable (the retained minimum).
    fn first_position(&self) -> AppResult<PhysicalPosition>;

    fn last_position(&self) -> AppResult<PhysicalPosition>;

    /// Read position of every durable cursor on this partition, by group.
    fn cursor_positions(&self) -> Vec<(String, PhysicalPosition)>;

    fn get_or_create_cursor<'a>(&'a self, group: &'a str) -> BoxFuture<'a, AppResult<CursorRef>>;
}

/// A group's durable consumption marker on one partition.
pub trait CursorHandle: Send + Sync + Debug {
    fn group(&self) -> &str;

    fn read_position(&self) -> PhysicalPosition;

    fn reset_to(&self, position: PhysicalPosition) -> BoxFuture<'_, AppResult<()>>;
}

pub trait SubscriptionRegistry: Send + Sync + Debug + 'static {
    fn has_active_subscription(&self, group: &str, topic: &str) -> bool;
}
