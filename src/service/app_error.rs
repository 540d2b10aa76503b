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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The partition lookup did not finish within the caller's wait.
    /// Retryable: the offset is temporarily unavailable, not missing.
    #[error("resolution of partition {topic}-{partition} timed out")]
    ResolutionTimeout { topic: String, partition: i32 },

    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    /// Storage-format mismatch between the codec and the store, never retried.
    #[error("position encoding overflow: {0}")]
    EncodingOverflow(String),

    #[error("persist failed for {failed} of {total} partitions")]
    PersistPartialFailure { failed: usize, total: usize },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("parse int error: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}

impl AppError {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ResolutionTimeout { .. } | AppError::StorageUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = AppError::ResolutionTimeout {
            topic: "t1".to_string(),
            partition: 0,
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "resolution of partition t1-0 timed out");

        assert!(AppError::StorageUnavailable("down".to_string()).is_retryable());
        assert!(!AppError::EncodingOverflow("entry".to_string()).is_retryable());
        assert!(!AppError::UnknownPartition("t1-9".to_string()).is_retryable());
    }
}
