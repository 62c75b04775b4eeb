//! Wire shapes for work items and replies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::broker::{
    BrokerResult, CorrelationId, Delivery, MessageProperties, OutboundMessage,
};

/// Opaque work payload: a JSON object.
pub type Payload = Map<String, Value>;

/// Numeric outcome reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const SUCCESS: Self = Self(0);
    /// No reply arrived before the call's deadline.
    pub const RPC_TIMEOUT: Self = Self(1);
    /// No usable broker connection, or declare/publish failed.
    pub const BROKER_UNAVAILABLE: Self = Self(10);
    /// The consumer had no admission token.
    pub const HIGH_SYSTEM_LOAD: Self = Self(20);
    /// The backend call failed.
    pub const BACKEND_FAILURE: Self = Self(21);
    /// A reply arrived but its body could not be decoded.
    pub const INVALID_REPLY: Self = Self(22);

    pub fn default_message(self) -> &'static str {
        match self {
            Self::SUCCESS => "success",
            Self::RPC_TIMEOUT => "rpc timeout",
            Self::BROKER_UNAVAILABLE => "broker unavailable",
            Self::HIGH_SYSTEM_LOAD => "high system load",
            Self::BACKEND_FAILURE => "backend failure",
            Self::INVALID_REPLY => "invalid reply",
            _ => "failure",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker serialized as `"state": "failure"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureState {
    Failure,
}

/// Reply produced after a backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Structured failure: overload, timeout, broker unavailability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub state: FailureState,
    #[serde(alias = "responsecode")]
    pub response_code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_msg: Option<String>,
}

/// Everything a call can resolve to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Outcome(Outcome),
    Failure(Failure),
}

impl Reply {
    pub fn success(data: Value) -> Self {
        Reply::Outcome(Outcome {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    pub fn backend_error(detail: Value) -> Self {
        Reply::Outcome(Outcome {
            success: false,
            data: None,
            error: Some(detail),
        })
    }

    /// Failure with the code's default message.
    pub fn failure(code: ResponseCode) -> Self {
        Self::failure_with(code, code.default_message())
    }

    pub fn failure_with(code: ResponseCode, message: impl Into<String>) -> Self {
        Reply::Failure(Failure {
            state: FailureState::Failure,
            response_code: code,
            response_msg: Some(message.into()),
        })
    }

    /// The admission-rejection reply.
    pub fn overloaded() -> Self {
        Self::failure(ResponseCode::HIGH_SYSTEM_LOAD)
    }

    pub fn timed_out() -> Self {
        Self::failure(ResponseCode::RPC_TIMEOUT)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Outcome(Outcome { success: true, .. }))
    }

    pub fn response_code(&self) -> ResponseCode {
        match self {
            Reply::Outcome(Outcome { success: true, .. }) => ResponseCode::SUCCESS,
            Reply::Outcome(_) => ResponseCode::BACKEND_FAILURE,
            Reply::Failure(f) => f.response_code,
        }
    }

    /// `"success"` or `"failure"`, as recorded in the audit trail.
    pub fn state(&self) -> &'static str {
        if self.is_success() {
            "success"
        } else {
            "failure"
        }
    }
}

/// Why a delivery could not be turned into a work item.
#[derive(Debug, Error)]
pub enum MalformedWorkItem {
    #[error("body is not a JSON object: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("missing reply_to property")]
    MissingReplyTo,

    #[error("missing correlation_id property")]
    MissingCorrelationId,
}

impl MalformedWorkItem {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            MalformedWorkItem::InvalidBody(_) => "invalid_body",
            MalformedWorkItem::MissingReplyTo => "missing_reply_to",
            MalformedWorkItem::MissingCorrelationId => "missing_correlation_id",
        }
    }
}

/// A unit of work travelling from client to consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub queue: String,
    pub correlation_id: CorrelationId,
    pub reply_to: String,
    pub expiration: Option<Duration>,
    pub payload: Payload,
}

impl WorkItem {
    pub fn into_message(self) -> BrokerResult<OutboundMessage> {
        let mut properties = MessageProperties::default()
            .with_correlation_id(self.correlation_id)
            .with_reply_to(self.reply_to);
        if let Some(ttl) = self.expiration {
            properties = properties.with_expiration(ttl);
        }
        OutboundMessage::json(properties, &self.payload)
    }

    /// Decode a delivery taken from `queue`.
    pub fn from_delivery(queue: &str, delivery: &Delivery) -> Result<Self, MalformedWorkItem> {
        let payload: Payload = serde_json::from_slice(&delivery.body)?;
        let reply_to = delivery
            .properties
            .reply_to
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or(MalformedWorkItem::MissingReplyTo)?;
        let correlation_id = delivery
            .properties
            .correlation_id
            .clone()
            .filter(|c| !c.as_str().is_empty())
            .ok_or(MalformedWorkItem::MissingCorrelationId)?;

        Ok(Self {
            queue: queue.to_string(),
            correlation_id,
            reply_to,
            expiration: delivery.properties.expiration,
            payload,
        })
    }

    /// The reply message for this item, addressed back to its caller.
    pub fn reply_message(&self, reply: &Reply) -> BrokerResult<OutboundMessage> {
        let properties =
            MessageProperties::default().with_correlation_id(self.correlation_id.clone());
        OutboundMessage::json(properties, reply)
    }
}
