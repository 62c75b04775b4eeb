//! Backend collaborator: the slow system admitted work is forwarded to.
//!
//! # Responsibilities
//! - Deliver one payload to one endpoint and return the response body
//! - Bound every call with a timeout
//! - Preserve the backend's error body so callers see the real cause

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::rpc::envelope::Payload;

pub use http::HttpBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend returned status {status}")]
    Status { status: u16, body: Value },

    #[error("backend transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// What goes in a failed reply's `error` field: the backend's own error
    /// body when it sent one, otherwise the error message.
    pub fn detail(&self) -> Value {
        match self {
            BackendError::Status { body, .. } if !body.is_null() => body.clone(),
            other => Value::String(other.to_string()),
        }
    }
}

/// Forwards a payload to an endpoint.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn invoke(&self, endpoint: &str, payload: &Payload) -> Result<Value, BackendError>;
}
