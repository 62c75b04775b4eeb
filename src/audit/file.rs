//! Append-only JSON-lines audit file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::record::{AuditRecord, RecordId, Stage};
use crate::audit::{AuditRecorder, AuditResult};
use crate::broker::CorrelationId;
use crate::rpc::envelope::{Payload, Reply};

/// Writes one `AuditRecord` per line. Writes are serialized so lines never
/// interleave.
pub struct FileRecorder {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileRecorder {
    pub async fn open(path: impl AsRef<Path>) -> AuditResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &AuditRecord) -> AuditResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditRecorder for FileRecorder {
    async fn record_request(
        &self,
        stage: Stage,
        queue: &str,
        correlation_id: &CorrelationId,
        payload: &Payload,
    ) -> AuditResult<RecordId> {
        let record_id = RecordId::generate();
        self.append(&AuditRecord::request(record_id, stage, queue, correlation_id, payload))
            .await?;
        Ok(record_id)
    }

    async fn record_response(
        &self,
        record_id: RecordId,
        reply: &Reply,
        timestamp_ms: u64,
    ) -> AuditResult<()> {
        self.append(&AuditRecord::response(record_id, reply, timestamp_ms))
            .await
    }
}
