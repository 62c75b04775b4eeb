//! In-memory and no-op recorders.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::audit::record::{AuditRecord, RecordId, Stage};
use crate::audit::{AuditError, AuditRecorder, AuditResult};
use crate::broker::CorrelationId;
use crate::rpc::envelope::{Payload, Reply};

/// Keeps records in memory. Can be switched to fail every call.
#[derive(Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder whose every call fails.
    pub fn failing() -> Self {
        let recorder = Self::default();
        recorder.set_failing(true);
        recorder
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> AuditResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AuditError::Unavailable("recorder set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuditRecorder for MemoryRecorder {
    async fn record_request(
        &self,
        stage: Stage,
        queue: &str,
        correlation_id: &CorrelationId,
        payload: &Payload,
    ) -> AuditResult<RecordId> {
        self.check()?;
        let record_id = RecordId::generate();
        self.lock().push(AuditRecord::request(
            record_id,
            stage,
            queue,
            correlation_id,
            payload,
        ));
        Ok(record_id)
    }

    async fn record_response(
        &self,
        record_id: RecordId,
        reply: &Reply,
        timestamp_ms: u64,
    ) -> AuditResult<()> {
        self.check()?;
        self.lock()
            .push(AuditRecord::response(record_id, reply, timestamp_ms));
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl AuditRecorder for NoopRecorder {
    async fn record_request(
        &self,
        _stage: Stage,
        _queue: &str,
        _correlation_id: &CorrelationId,
        _payload: &Payload,
    ) -> AuditResult<RecordId> {
        Ok(RecordId::generate())
    }

    async fn record_response(
        &self,
        _record_id: RecordId,
        _reply: &Reply,
        _timestamp_ms: u64,
    ) -> AuditResult<()> {
        Ok(())
    }
}
