//! Stream source seam: at-least-once, ordered delivery with a resumable
//! read position.
//!
//! [`FileSource`] replays a newline-delimited file, one message per line,
//! with `offset` = line index. [`OffsetStore`] persists the next offset per
//! consumer group so a restarted pipeline resumes from the last committed
//! position; re-processing the gap is tolerated by the sink's upsert
//! semantics.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::info;

/// One raw message from a stream.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub payload: Bytes,
    /// Position of this message within the stream; committing `offset + 1`
    /// resumes after it.
    pub offset: u64,
}

#[async_trait]
pub trait StreamSource: Send {
    /// Next message, or `None` when the stream is exhausted.
    async fn next_message(&mut self) -> Result<Option<SourceMessage>>;
}

/// Line-by-line file replay source.
pub struct FileSource {
    lines: Lines<BufReader<File>>,
    next_offset: u64,
}

impl FileSource {
    /// Opens `path` positioned at `start_offset` (line index).
    pub async fn open(path: &str, start_offset: u64) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("opening stream source '{path}'"))?;
        let mut lines = BufReader::new(file).lines();
        for _ in 0..start_offset {
            if lines.next_line().await?.is_none() {
                break;
            }
        }
        info!(path, start_offset, "stream source opened");
        Ok(Self {
            lines,
            next_offset: start_offset,
        })
    }
}

#[async_trait]
impl StreamSource for FileSource {
    async fn next_message(&mut self) -> Result<Option<SourceMessage>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) => {
                    let offset = self.next_offset;
                    self.next_offset += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(SourceMessage {
                        payload: Bytes::from(line.into_bytes()),
                        offset,
                    }));
                }
                None => return Ok(None),
            }
        }
    }
}

/// Committed read positions, one per consumer group, stored as a JSON map
/// on disk. Shared by the ingest tasks via `Arc`; the mutex serializes the
/// read-modify-write of the file.
pub struct OffsetStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Last committed position for `group`; 0 when nothing was committed.
    pub fn position(&self, group: &str) -> Result<u64> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("offset store lock poisoned"))?;
        Ok(self.read_all()?.get(group).copied().unwrap_or(0))
    }

    /// Durably records that `group` has processed everything before
    /// `offset`.
    pub fn commit(&self, group: &str, offset: u64) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("offset store lock poisoned"))?;
        let mut all = self.read_all()?;
        all.insert(group.to_string(), offset);
        let body = serde_json::to_vec_pretty(&all)?;
        std::fs::write(&self.path, body)
            .with_context(|| format!("writing offset store '{}'", self.path.display()))?;
        Ok(())
    }

    fn read_all(&self) -> Result<HashMap<String, u64>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing offset store '{}'", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).with_context(|| {
                format!("reading offset store '{}'", self.path.display())
            }),
        }
    }
}
