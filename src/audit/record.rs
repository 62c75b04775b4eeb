//! Audit record type.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::CorrelationId;
use crate::rpc::envelope::{Payload, Reply, ResponseCode};

/// Identifies one request and links its response to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where in the bridge a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Client side, before the work item is published.
    Downstream,
    /// Consumer side, before the backend is called.
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Request,
    Response,
}

/// One audit event. Request records carry the payload; response records
/// carry the reply and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: RecordId,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<ResponseCode>,
    pub timestamp_ms: u64,
}

impl AuditRecord {
    pub fn request(
        record_id: RecordId,
        stage: Stage,
        queue: &str,
        correlation_id: &CorrelationId,
        payload: &Payload,
    ) -> Self {
        Self {
            record_id,
            kind: RecordKind::Request,
            stage: Some(stage),
            queue: Some(queue.to_string()),
            correlation_id: Some(correlation_id.clone()),
            payload: Some(serde_json::Value::Object(payload.clone())),
            state: None,
            response_code: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn response(record_id: RecordId, reply: &Reply, timestamp_ms: u64) -> Self {
        Self {
            record_id,
            kind: RecordKind::Response,
            stage: None,
            queue: None,
            correlation_id: None,
            payload: serde_json::to_value(reply).ok(),
            state: Some(reply.state().to_string()),
            response_code: Some(reply.response_code()),
            timestamp_ms,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
