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

pub mod offset;
pub mod partition;
pub mod service;
pub mod storage;
pub mod utils;

pub use offset::{
    GroupTopicKey, LogicalOffset, OffsetManager, OffsetSnapshot, OffsetTable, PersistReport,
    PhysicalPosition, TopicKey, TopicPartition,
};
pub use partition::{PartitionCache, ResolveFailure};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Bridge, BridgeConfig, OtelGuard,
    Shutdown,
};
