//! HTTP backend client.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::backend::{Backend, BackendError};
use crate::config::BackendConfig;
use crate::rpc::envelope::Payload;

/// POSTs payloads as JSON and returns the decoded response body.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        Self::with_timeout(config.timeout())
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// JSON when possible, raw text otherwise, null when empty.
fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn invoke(&self, endpoint: &str, payload: &Payload) -> Result<Value, BackendError> {
        let call = async {
            let response = self
                .client
                .post(endpoint)
                .json(payload)
                .send()
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;
            Ok::<_, BackendError>((status, decode_body(&bytes)))
        };

        let (status, body) = match timeout(self.timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(endpoint = %endpoint, timeout_ms = self.timeout.as_millis() as u64, "Backend call timed out");
                return Err(BackendError::Timeout(self.timeout));
            }
        };

        if !status.is_success() {
            tracing::warn!(endpoint = %endpoint, status = status.as_u16(), "Backend returned error status");
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(b""), Value::Null);
        assert_eq!(decode_body(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(decode_body(b"Bad Gateway"), json!("Bad Gateway"));
    }
}
