//! Message, delivery and subscription types shared by every broker backend.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::error::BrokerResult;

/// Unique token linking a work item to its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh, globally unique correlation ID (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-level properties carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Correlation ID echoed back on the reply.
    pub correlation_id: Option<CorrelationId>,
    /// Queue the reply should be sent to.
    pub reply_to: Option<String>,
    /// Time-to-live while the message sits in a queue.
    pub expiration: Option<Duration>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Expiration encoded the way AMQP expects it: milliseconds as a decimal string.
    pub fn expiration_millis(&self) -> Option<String> {
        self.expiration.map(|ttl| ttl.as_millis().to_string())
    }

    /// Parse an AMQP expiration header back into a duration.
    pub fn parse_expiration(raw: &str) -> Option<Duration> {
        raw.trim().parse::<u64>().ok().map(Duration::from_millis)
    }
}

/// A message about to be published.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(properties: MessageProperties, body: Vec<u8>) -> Self {
        Self { properties, body }
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize>(properties: MessageProperties, value: &T) -> BrokerResult<Self> {
        Ok(Self {
            properties,
            body: serde_json::to_vec(value)?,
        })
    }
}

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
}

/// A message handed to a subscriber.
pub struct Delivery {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Set by the broker when this message was handed out before and never acknowledged.
    pub redelivered: bool,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// `acker` is `None` for auto-acknowledged subscriptions.
    pub fn new(
        properties: MessageProperties,
        body: Vec<u8>,
        redelivered: bool,
        acker: Option<Box<dyn Acknowledger>>,
    ) -> Self {
        Self {
            properties,
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledge the delivery. A no-op for auto-acknowledged subscriptions.
    pub async fn ack(&self) -> BrokerResult<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

/// How a subscription acknowledges deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The subscriber must call [`Delivery::ack`]; the channel prefetch applies.
    Manual,
    /// The broker considers a message acknowledged once it is sent.
    Auto,
}

/// Stream of deliveries for one subscription. Ends when the subscription is
/// cancelled or its channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// An active consumer on a queue.
pub struct Subscription {
    pub consumer_tag: String,
    pub queue: String,
    pub deliveries: DeliveryStream,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .field("queue", &self.queue)
            .finish()
    }
}
