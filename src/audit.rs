//! Per-session audit records: one start event when a request has been
//! parsed, one end event when the session finishes.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub start_time: u64,
    pub client_ip: String,
    pub operation: i64,
    pub file_name: String,
    pub file_size: u64,
    pub media_type: String,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log_start(&self, record: SessionRecord) -> Result<u64>;
    async fn log_end(&self, record_id: u64, end_time: u64) -> Result<()>;
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Audit logging switched off
pub struct NullAuditLog;

#[async_trait]
impl AuditLog for NullAuditLog {
    async fn log_start(&self, _record: SessionRecord) -> Result<u64> {
        Ok(0)
    }

    async fn log_end(&self, _record_id: u64, _end_time: u64) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Start {
        id: u64,
        #[serde(flatten)]
        record: SessionRecord,
    },
    End {
        id: u64,
        end_time: u64,
    },
}

/// Appends one JSON object per event to a file.
pub struct JsonlAuditLog {
    path: PathBuf,
    next_id: AtomicU64,
    writer: Mutex<()>,
}

impl JsonlAuditLog {
    /// Record ids continue after the highest id already in the file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let last_id = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content
                .lines()
                .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
                .map(|event| match event {
                    AuditEvent::Start { id, .. } | AuditEvent::End { id, .. } => id,
                })
                .max()
                .unwrap_or(0),
            Err(_) => 0,
        };

        Ok(Self {
            path,
            next_id: AtomicU64::new(last_id + 1),
            writer: Mutex::new(()),
        })
    }

    async fn append(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.writer.lock().await;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn log_start(&self, record: SessionRecord) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.append(&AuditEvent::Start { id, record }).await?;
        Ok(id)
    }

    async fn log_end(&self, record_id: u64, end_time: u64) -> Result<()> {
        self.append(&AuditEvent::End { id: record_id, end_time }).await
    }
}
