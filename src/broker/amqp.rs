//! RabbitMQ backend built on `lapin`.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use url::Url;
use uuid::Uuid;

use crate::broker::{
    AckMode, Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult,
    CorrelationId, Delivery, MessageProperties, OutboundMessage, Subscription,
};
use crate::config::BrokerConfig;

/// Interval at which a connection's status is polled in case the error
/// callback never fires (e.g. a clean server-side close).
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
            lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
            other => BrokerError::Protocol(other.to_string()),
        }
    }
}

/// Connects to RabbitMQ over AMQP 0-9-1.
pub struct AmqpBroker {
    uri: String,
    display: String,
}

impl AmqpBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: with_heartbeat(&config.url, config.heartbeat_secs),
            display: redact(&config.url),
        }
    }
}

/// Append `heartbeat=<secs>` to the URI unless it already sets one.
fn with_heartbeat(uri: &str, heartbeat_secs: u16) -> String {
    match Url::parse(uri) {
        Ok(mut url) => {
            if !url.query_pairs().any(|(key, _)| key == "heartbeat") {
                url.query_pairs_mut()
                    .append_pair("heartbeat", &heartbeat_secs.to_string());
            }
            url.to_string()
        }
        Err(_) => uri.to_string(),
    }
}

fn redact(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid broker url>".to_string(),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let signal = closed_tx.clone();
        connection.on_error(move |err| {
            tracing::error!(error = %err, "Broker connection error");
            signal.send_replace(true);
        });

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            closed_tx,
        }))
    }

    fn describe(&self) -> String {
        self.display.clone()
    }
}

struct AmqpConnection {
    inner: Connection,
    closed_tx: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = rx.wait_for(|closed| *closed) => return,
                _ = poll.tick() => {
                    if !self.inner.status().connected() {
                        return;
                    }
                }
            }
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed_tx.send_replace(true);
        if self.inner.status().connected() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !*self.closed_tx.borrow() && self.inner.status().connected()
    }
}

struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()> {
        let options = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };
        self.inner
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_reply_queue(&self) -> BrokerResult<String> {
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .inner
            .queue_declare("", options, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> BrokerResult<Subscription> {
        let consumer_tag = format!("{queue}-{}", Uuid::new_v4().simple());
        let options = BasicConsumeOptions {
            no_ack: mode == AckMode::Auto,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, &consumer_tag, options, FieldTable::default())
            .await?;

        let queue_name = queue.to_string();
        let deliveries = consumer
            .take_while(move |result| {
                if let Err(err) = result {
                    tracing::warn!(queue = %queue_name, error = %err, "Consumer stream failed");
                }
                future::ready(result.is_ok())
            })
            .filter_map(|result| future::ready(result.ok()))
            .map(convert_delivery);

        Ok(Subscription {
            consumer_tag,
            queue: queue.to_string(),
            deliveries: Box::pin(deliveries),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> BrokerResult<()> {
        let properties = outbound_properties(&message.properties);
        self.inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.inner.status().connected() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

fn outbound_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default().with_content_type("application/json".into());
    if let Some(id) = &props.correlation_id {
        properties = properties.with_correlation_id(id.as_str().into());
    }
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    if let Some(expiration) = props.expiration_millis() {
        properties = properties.with_expiration(expiration.into());
    }
    properties
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|id| CorrelationId::from(id.as_str())),
        reply_to: props.reply_to().as_ref().map(|q| q.as_str().to_string()),
        expiration: props
            .expiration()
            .as_ref()
            .and_then(|raw| MessageProperties::parse_expiration(raw.as_str())),
    };
    let acker: Box<dyn Acknowledger> = Box::new(AmqpAcker(delivery.acker));
    Delivery::new(
        properties,
        delivery.data,
        delivery.redelivered,
        Some(acker),
    )
}
