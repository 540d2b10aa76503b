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

//! Bijection between the store's physical positions and client offsets.
//!
//! Layout of a logical offset (sign bit always clear):
//!
//! ```text
//! | 0 | segment id (35 bits) | entry index (28 bits) |
//! ```
//!
//! Because the segment id occupies the high bits, numeric order of the
//! offsets is exactly segment-major, entry-minor append order.

use std::fmt::{Display, Formatter};

use crate::{AppError, AppResult};

use super::LogicalOffset;

/// Bits reserved for the entry index inside one segment.
pub const ENTRY_BITS: u32 = 28;
pub const MAX_ENTRY_INDEX: i64 = (1 << ENTRY_BITS) - 1;
pub const MAX_SEGMENT_ID: i64 = i64::MAX >> ENTRY_BITS;

/// A record's native address in the store. Field order gives the derived
/// `Ord` its segment-major ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalPosition {
    pub segment_id: i64,
    pub entry_index: i64,
}

impl PhysicalPosition {
    pub fn new(segment_id: i64, entry_index: i64) -> Self {
        Self {
            segment_id,
            entry_index,
        }
    }
}

impl Display for PhysicalPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.entry_index)
    }
}

pub fn encode(position: PhysicalPosition) -> AppResult<LogicalOffset> {
    if !(0..=MAX_ENTRY_INDEX).contains(&position.entry_index) {
        return Err(AppError::EncodingOverflow(format!(
            "entry index {} does not fit in {} bits",
            position.entry_index, ENTRY_BITS
        )));
    }
    if !(0..=MAX_SEGMENT_ID).contains(&position.segment_id) {
        return Err(AppError::EncodingOverflow(format!(
            "segment id {} does not fit in {} bits",
            position.segment_id,
            63 - ENTRY_BITS
        )));
    }
    Ok((position.segment_id << ENTRY_BITS) | position.entry_index)
}

/// Negative offsets (including the unknown sentinel) have no position.
pub fn decode(offset: LogicalOffset) -> AppResult<PhysicalPosition> {
    if offset < 0 {
        return Err(AppError::InvalidValue(format!(
            "offset {} has no physical position",
            offset
        )));
    }
    Ok(PhysicalPosition {
        segment_id: offset >> ENTRY_BITS,
        entry_index: offset & MAX_ENTRY_INDEX,
    })
}
