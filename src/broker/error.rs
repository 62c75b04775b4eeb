//! Broker error definitions.

use thiserror::Error;

/// Errors raised by broker connections and channels.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the connection.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The connection was closed underneath the caller.
    #[error("broker connection closed")]
    ConnectionClosed,

    /// The channel was closed underneath the caller.
    #[error("broker channel closed")]
    ChannelClosed,

    /// A consumer was requested for a queue that does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A consumer tag is unknown to the channel.
    #[error("unknown consumer tag: {0}")]
    UnknownConsumer(String),

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Any other protocol-level failure reported by the client library.
    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// Encoding an outbound body failed.
    #[error("message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
