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

use std::borrow::Cow;
use std::collections::HashMap;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{trace, warn};

use crate::offset::{PhysicalPosition, TopicPartition};
use crate::AppError::InvalidValue;
use crate::AppResult;

/// Cursor read positions keyed by (group, partition).
pub type CursorPoints = HashMap<(String, TopicPartition), PhysicalPosition>;

/// Text file holding every durable cursor of the local store:
///
/// ```text
/// 1
/// <group> <topic>-<partition> <segment>:<entry>
/// ```
#[derive(Debug)]
pub struct CursorCheckpointFile {
    file_name: String,
    version: i8,
}

impl CursorCheckpointFile {
    pub const CK_FILE_VERSION_1: i8 = 1;

    pub fn new(file_name: impl AsRef<str>) -> Self {
        Self {
            file_name: file_name.as_ref().to_string(),
            version: Self::CK_FILE_VERSION_1,
        }
    }

    /// Writes every cursor whose group and topic fit the line format. Others
    /// are skipped with a warning and not written.
    pub async fn write_checkpoints(&self, points: &CursorPoints) -> AppResult<()> {
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.file_name)
            .await?;
        let mut buf_writer = BufWriter::new(write_file);
        buf_writer
            .write_all(format!("{}\n", self.version).as_bytes())
            .await?;
        let mut written = 0;
        for ((group, topic_partition), position) in points {
            if !Self::is_writable(group) || !Self::is_writable(topic_partition.topic.as_str()) {
                warn!(
                    "skip checkpoint of cursor {:?} on {:?}: empty or contains whitespace",
                    group, topic_partition.topic.as_str()
                );
                continue;
            }
            written += 1;
            buf_writer
                .write_all(format!("{} {} {}\n", group, topic_partition, position).as_bytes())
                .await?;
        }
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        trace!("wrote {} cursors to {}", written, self.file_name);
        Ok(())
    }

    fn is_writable(name: &str) -> bool {
        !name.is_empty() && !name.contains(char::is_whitespace)
    }

    pub async fn read_checkpoints(&self) -> AppResult<CursorPoints> {
        let error = |line: &str| InvalidValue(format!("cursor checkpoint line {:?}", line));
        let open_file = OpenOptions::new().read(true).open(&self.file_name).await;
        let Ok(open_file) = open_file else {
            warn!(
                "cursor checkpoint {} not found; expected on first start",
                self.file_name
            );
            return Ok(HashMap::new());
        };

        let mut reader = BufReader::new(open_file);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let version = line.trim().parse::<i8>()?;
        if version != self.version {
            return Err(InvalidValue(format!(
                "cursor checkpoint version {}, expected {}",
                version, self.version
            )));
        }

        let mut points = HashMap::new();
        line.clear();
        while reader.read_line(&mut line).await? > 0 {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let [group, topic_partition, position] = parts[..] else {
                return Err(error(&line));
            };
            let topic_partition = TopicPartition::from_string(Cow::Borrowed(topic_partition))?;
            let (segment, entry) = position.split_once(':').ok_or_else(|| error(&line))?;
            let position = PhysicalPosition::new(segment.parse()?, entry.parse()?);
            points.insert((group.to_string(), topic_partition), position);
            line.clear();
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;
    use tokio::fs;

    use super::*;

    #[tokio::test]
    async fn test_write_and_read_checkpoints() -> AppResult<()> {
        let temp_file = NamedTempFile::new()?;
        let checkpoint_file = CursorCheckpointFile::new(temp_file.path().to_string_lossy());

        let mut points = HashMap::new();
        points.insert(
            ("app/orders-group".to_string(), TopicPartition::new("orders-v2", 0)),
            PhysicalPosition::new(12, 99),
        );
        points.insert(
            ("billing".to_string(), TopicPartition::new("payments", 3)),
            PhysicalPosition::new(0, 0),
        );

        checkpoint_file.write_checkpoints(&points).await?;
        assert_eq!(checkpoint_file.read_checkpoints().await?, points);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() -> AppResult<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("absent");
        let checkpoint_file = CursorCheckpointFile::new(path.to_string_lossy());
        assert!(checkpoint_file.read_checkpoints().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_version() -> AppResult<()> {
        let temp_file = NamedTempFile::new()?;
        fs::write(temp_file.path(), "2\n").await?;

        let checkpoint_file = CursorCheckpointFile::new(temp_file.path().to_string_lossy());
        assert!(checkpoint_file.read_checkpoints().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_format() -> AppResult<()> {
        let temp_file = NamedTempFile::new()?;
        fs::write(temp_file.path(), "1\ng1 topic1-0 12\n").await?;

        let checkpoint_file = CursorCheckpointFile::new(temp_file.path().to_string_lossy());
        assert!(checkpoint_file.read_checkpoints().await.is_err());

        fs::write(temp_file.path(), "1\ng1 topic1-0\n").await?;
        assert!(checkpoint_file.read_checkpoints().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_skips_names_with_whitespace() -> AppResult<()> {
        let temp_file = NamedTempFile::new()?;
        let checkpoint_file = CursorCheckpointFile::new(temp_file.path().to_string_lossy());
        let good = ("g1".to_string(), TopicPartition::new("t", 0));
        let points = HashMap::from([
            (good.clone(), PhysicalPosition::new(3, 7)),
            (
                ("bad group".to_string(), TopicPartition::new("t", 0)),
                PhysicalPosition::new(1, 1),
            ),
            (
                ("g1".to_string(), TopicPartition::new("bad topic", 1)),
                PhysicalPosition::new(1, 1),
            ),
            (
                (String::new(), TopicPartition::new("t", 2)),
                PhysicalPosition::new(1, 1),
            ),
        ]);

        checkpoint_file.write_checkpoints(&points).await?;
        assert_eq!(
            checkpoint_file.read_checkpoints().await?,
            HashMap::from([(good, PhysicalPosition::new(3, 7))])
        );
        Ok(())
    }
}
