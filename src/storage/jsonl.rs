//! Append-only JSON-lines file sink.
//!
//! One record per line. History reads scan the whole file; malformed lines
//! (a torn final write after a crash, for instance) are skipped with a warning.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{DocumentSink, Record, RecordKind};
use crate::error::{GatewayError, GatewayResult};

/// File-backed [`DocumentSink`].
pub struct JsonLinesSink {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    append: Mutex<()>,
}

impl JsonLinesSink {
    /// Open (creating parent directories) the sink at `path`.
    pub async fn open(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        info!(path = %path.display(), "JSON-lines sink ready");
        Ok(Self {
            path,
            append: Mutex::new(()),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentSink for JsonLinesSink {
    async fn insert(&self, record: &Record) -> GatewayResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.append.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| GatewayError::Persistence(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(&line)
            .await
            .map_err(|e| GatewayError::Persistence(format!("{}: {}", self.path.display(), e)))?;
        file.flush().await?;
        Ok(())
    }

    async fn query(
        &self,
        kind: RecordKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<Record>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut hits = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(line) {
                Ok(record) if record.matches(kind, from, to) => hits.push(record),
                Ok(_) => {}
                Err(e) => warn!(line = number + 1, error = %e, "Skipping malformed record"),
            }
        }
        Ok(hits)
    }
}
