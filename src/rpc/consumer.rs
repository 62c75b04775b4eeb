//! Server side of the bridge: admission-controlled queue workers.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::audit::{AuditTrail, Stage};
use crate::backend::Backend;
use crate::broker::{AckMode, BrokerChannel, BrokerConnection, BrokerResult, Delivery, Subscription};
use crate::config::{BridgeConfig, ConfigError, ValidationError};
use crate::connection::SessionHook;
use crate::limiter::{Admission, BucketRegistry};
use crate::observability::metrics;
use crate::rpc::envelope::{Reply, WorkItem};

/// A queue and the backend endpoint its work goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRoute {
    pub queue: String,
    pub endpoint: String,
}

impl QueueRoute {
    pub fn new(queue: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Resolve every configured queue to an absolute endpoint.
    pub fn from_config(config: &BridgeConfig) -> Result<Vec<Self>, ConfigError> {
        config
            .queues
            .iter()
            .map(|queue| {
                queue
                    .resolve_endpoint(&config.backend.base_url)
                    .map(|url| Self::new(&queue.name, url.as_str()))
                    .map_err(|e| {
                        ConfigError::Validation(vec![ValidationError {
                            field: format!("queues.{}.endpoint", queue.name),
                            message: e.to_string(),
                        }])
                    })
            })
            .collect()
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Malformed; acknowledged and discarded without a reply.
    Dropped,
    /// Handed out before; acknowledged and discarded without a backend call.
    Redelivered,
    /// Rejected by the limiter; overload reply sent.
    Rejected,
    /// Forwarded to the backend; reply sent.
    Forwarded { success: bool },
}

/// Subscribes every configured queue on each new broker session.
pub struct RpcConsumer {
    routes: Vec<QueueRoute>,
    limiter: Arc<BucketRegistry>,
    backend: Arc<dyn Backend>,
    audit: AuditTrail,
    prefetch: u16,
}

impl RpcConsumer {
    pub fn new(
        routes: Vec<QueueRoute>,
        limiter: Arc<BucketRegistry>,
        backend: Arc<dyn Backend>,
        audit: AuditTrail,
        prefetch: u16,
    ) -> Self {
        Self {
            routes,
            limiter,
            backend,
            audit,
            prefetch,
        }
    }

    pub fn routes(&self) -> &[QueueRoute] {
        &self.routes
    }

    fn worker(&self, route: &QueueRoute, channel: &Arc<dyn BrokerChannel>) -> QueueWorker {
        QueueWorker {
            route: route.clone(),
            channel: channel.clone(),
            limiter: self.limiter.clone(),
            backend: self.backend.clone(),
            audit: self.audit.clone(),
        }
    }
}

#[async_trait]
impl SessionHook for RpcConsumer {
    async fn on_connected(&self, connection: Arc<dyn BrokerConnection>) -> BrokerResult<()> {
        let channel = connection.open_channel().await?;
        channel.set_prefetch(self.prefetch).await?;

        for route in &self.routes {
            channel.declare_queue(&route.queue, true).await?;
            let subscription = channel.consume(&route.queue, AckMode::Manual).await?;
            tokio::spawn(self.worker(route, &channel).run(subscription));
            tracing::info!(queue = %route.queue, endpoint = %route.endpoint, "Listening on queue");
        }
        Ok(())
    }
}

/// Handles deliveries for one queue subscription, one at a time.
pub struct QueueWorker {
    route: QueueRoute,
    channel: Arc<dyn BrokerChannel>,
    limiter: Arc<BucketRegistry>,
    backend: Arc<dyn Backend>,
    audit: AuditTrail,
}

impl QueueWorker {
    pub async fn run(self, mut subscription: Subscription) {
        while let Some(delivery) = subscription.deliveries.next().await {
            self.handle(delivery).await;
        }
        tracing::info!(queue = %self.route.queue, "Subscription ended");
    }

    /// Process one delivery. The delivery is always acknowledged exactly once.
    pub async fn handle(&self, delivery: Delivery) -> Handled {
        let queue = self.route.queue.as_str();

        if delivery.redelivered {
            tracing::warn!(queue = %queue, correlation_id = ?delivery.properties.correlation_id, "Dropping redelivered work item");
            metrics::record_redelivered(queue);
            self.ack(&delivery).await;
            return Handled::Redelivered;
        }

        let item = match WorkItem::from_delivery(queue, &delivery) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "Dropping malformed work item");
                metrics::record_malformed(queue, e.reason());
                self.ack(&delivery).await;
                return Handled::Dropped;
            }
        };

        let admission = self.limiter.try_admit(queue);
        metrics::record_admission(queue, admission.is_admitted());

        let handled = match admission {
            Admission::Rejected { bucket } => {
                tracing::info!(
                    queue = %queue,
                    bucket = %bucket,
                    correlation_id = %item.correlation_id,
                    "No token available, replying with high system load"
                );
                self.reply(&item, &Reply::overloaded()).await;
                Handled::Rejected
            }
            Admission::Admitted { .. } | Admission::Unlimited => {
                let reply = self.forward(&item).await;
                let success = reply.is_success();
                self.reply(&item, &reply).await;
                Handled::Forwarded { success }
            }
        };

        self.ack(&delivery).await;
        handled
    }

    async fn forward(&self, item: &WorkItem) -> Reply {
        let record = self
            .audit
            .request(Stage::Upstream, &item.queue, &item.correlation_id, &item.payload)
            .await;

        let reply = match self.backend.invoke(&self.route.endpoint, &item.payload).await {
            Ok(body) => {
                metrics::record_backend_call(&item.queue, true);
                Reply::success(body)
            }
            Err(e) => {
                metrics::record_backend_call(&item.queue, false);
                tracing::warn!(
                    queue = %item.queue,
                    correlation_id = %item.correlation_id,
                    endpoint = %self.route.endpoint,
                    error = %e,
                    "Backend call failed"
                );
                Reply::backend_error(e.detail())
            }
        };

        self.audit.response(record, &reply).await;
        reply
    }

    async fn reply(&self, item: &WorkItem, reply: &Reply) {
        let result = match item.reply_message(reply) {
            Ok(message) => self.channel.publish(&item.reply_to, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::error!(
                queue = %item.queue,
                correlation_id = %item.correlation_id,
                error = %e,
                "Failed to publish reply"
            );
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack().await {
            tracing::warn!(queue = %self.route.queue, error = %e, "Failed to acknowledge delivery");
        }
    }
}
