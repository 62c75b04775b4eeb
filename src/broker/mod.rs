//! Message broker subsystem.
//!
//! # Data Flow
//! ```text
//! Broker::connect()
//!     → BrokerConnection (one per reconnect cycle, owned by the ConnectionManager)
//!         → open_channel() → BrokerChannel
//!             → declare_queue / declare_reply_queue
//!             → consume()  → Subscription (stream of Delivery)
//!             → publish()  → OutboundMessage onto a named queue
//! ```
//!
//! # Backends
//! - `amqp.rs`: RabbitMQ through `lapin`
//! - `memory.rs`: in-process broker used by tests and local development
//!
//! # Design Decisions
//! - Messages are always published through the default exchange, routed by queue name
//! - Publishing to a queue that does not exist is not an error; the broker drops it
//! - Reply queues are exclusive and deleted once their consumer is cancelled

pub mod amqp;
pub mod error;
pub mod memory;
pub mod message;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::{BrokerError, BrokerResult};
pub use message::{
    AckMode, Acknowledger, CorrelationId, Delivery, DeliveryStream, MessageProperties,
    OutboundMessage, Subscription,
};

/// Entry point to a broker: produces fresh connections.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>>;

    /// Human-readable broker address for logs. Must not leak credentials.
    fn describe(&self) -> String;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Resolves once the connection has closed or failed.
    async fn closed(&self);

    async fn close(&self) -> BrokerResult<()>;

    fn is_connected(&self) -> bool;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Cap the number of unacknowledged deliveries in flight per consumer.
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()>;

    /// Declare an exclusive, auto-deleted, server-named queue and return its name.
    async fn declare_reply_queue(&self) -> BrokerResult<String>;

    async fn consume(&self, queue: &str, mode: AckMode) -> BrokerResult<Subscription>;

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn publish(&self, queue: &str, message: OutboundMessage) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}
