//! Audit trail.
//!
//! # Data Flow
//! ```text
//! RpcClient::call                         RpcConsumer (admitted item)
//!     → record_request(Downstream)            → record_request(Upstream)
//!     → ... publish / wait ...                → backend call
//!     → record_response(reply)                → record_response(reply)
//! ```
//!
//! # Design Decisions
//! - Recording is best effort: `AuditTrail` logs failures and never blocks resolution
//! - Records are a statically declared type (`AuditRecord`), one JSON object per line on disk

pub mod file;
pub mod memory;
pub mod record;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::CorrelationId;
use crate::rpc::envelope::{Payload, Reply};

pub use file::FileRecorder;
pub use memory::{MemoryRecorder, NoopRecorder};
pub use record::{now_ms, AuditRecord, RecordId, RecordKind, Stage};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

pub type AuditResult<T> = Result<T, AuditError>;

/// Persists request and response snapshots.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record_request(
        &self,
        stage: Stage,
        queue: &str,
        correlation_id: &CorrelationId,
        payload: &Payload,
    ) -> AuditResult<RecordId>;

    async fn record_response(
        &self,
        record_id: RecordId,
        reply: &Reply,
        timestamp_ms: u64,
    ) -> AuditResult<()>;
}

/// Best-effort wrapper around a recorder: failures are logged and swallowed.
#[derive(Clone)]
pub struct AuditTrail {
    recorder: Arc<dyn AuditRecorder>,
}

impl AuditTrail {
    pub fn new(recorder: Arc<dyn AuditRecorder>) -> Self {
        Self { recorder }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopRecorder))
    }

    pub async fn request(
        &self,
        stage: Stage,
        queue: &str,
        correlation_id: &CorrelationId,
        payload: &Payload,
    ) -> Option<RecordId> {
        match self
            .recorder
            .record_request(stage, queue, correlation_id, payload)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(queue = %queue, correlation_id = %correlation_id, error = %e, "Failed to record audit request");
                None
            }
        }
    }

    pub async fn response(&self, record_id: Option<RecordId>, reply: &Reply) {
        let Some(record_id) = record_id else { return };
        if let Err(e) = self
            .recorder
            .record_response(record_id, reply, now_ms())
            .await
        {
            tracing::warn!(record_id = %record_id, error = %e, "Failed to record audit response");
        }
    }
}
