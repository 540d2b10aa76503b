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

//! Consumer offset bookkeeping.
//!
//! - `codec`: physical position <-> logical offset
//! - `offset_table`: committed offsets per (group, topic, partition)
//! - `manager`: joins the table with the partition cache
//! - `sweeper` / `persist`: the two periodic passes, driven by `tasks`

pub mod codec;
mod manager;
mod offset_table;
mod persist;
mod sweeper;
mod tasks;

pub use codec::PhysicalPosition;
pub use manager::OffsetManager;
pub use offset_table::{OffsetSnapshot, OffsetTable};
pub use persist::PersistReport;

use std::borrow::{Borrow, Cow};
use std::fmt::{Display, Formatter};

use crate::{AppError, AppResult};

/// Client-visible position inside a partition.
pub type LogicalOffset = i64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicKey(String);

impl TopicKey {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TopicKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TopicKey {
    fn from(topic: &str) -> Self {
        Self::new(topic)
    }
}

impl Display for TopicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupTopicKey {
    pub group: String,
    pub topic: TopicKey,
}

impl GroupTopicKey {
    pub fn new(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            topic: TopicKey::new(topic),
        }
    }
}

impl Display for GroupTopicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.topic, self.group)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicPartition {
    pub topic: TopicKey,
    pub partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: TopicKey::new(topic),
            partition,
        }
    }

    /// Parses the `topic-partition` form written by `Display`. Topic names
    /// may contain `-`, the partition is after the last one.
    pub fn from_string(str_name: Cow<str>) -> AppResult<Self> {
        let (topic, partition) = str_name
            .rsplit_once('-')
            .ok_or_else(|| AppError::InvalidValue(format!("topic partition name {}", str_name)))?;
        let partition = partition.parse()?;
        Ok(Self::new(topic, partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_from_string() {
        let tp = TopicPartition::from_string(Cow::Borrowed("order-events-12")).unwrap();
        assert_eq!(tp.topic.as_str(), "order-events");
        assert_eq!(tp.partition, 12);
        assert_eq!(tp.to_string(), "order-events-12");

        assert!(TopicPartition::from_string(Cow::Borrowed("no_partition")).is_err());
        assert!(TopicPartition::from_string(Cow::Borrowed("topic-x")).is_err());
    }

    #[test]
    fn test_group_topic_key_equality() {
        assert_eq!(GroupTopicKey::new("g1", "t1"), GroupTopicKey::new("g1", "t1"));
        assert_ne!(GroupTopicKey::new("g1", "t1"), GroupTopicKey::new("g1", "t2"));
        assert_eq!(GroupTopicKey::new("g1", "t1").to_string(), "t1@g1");
    }
}
