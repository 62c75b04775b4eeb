//! Client side of the bridge: publish a work item, wait for its reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;

use crate::audit::{AuditTrail, Stage};
use crate::broker::{AckMode, BrokerChannel, BrokerResult, CorrelationId, DeliveryStream};
use crate::connection::ConnectionManager;
use crate::observability::metrics;
use crate::rpc::envelope::{Payload, Reply, ResponseCode, WorkItem};
use crate::rpc::pending::{PendingCall, Resolution};

/// Issues calls over the manager's current connection.
///
/// Every call gets its own channel and exclusive reply queue; both are torn
/// down when the call resolves. Calls never retry: with no live connection
/// they fail immediately with `BROKER_UNAVAILABLE`.
pub struct RpcClient {
    manager: Arc<ConnectionManager>,
    audit: AuditTrail,
    default_timeout: Duration,
}

impl RpcClient {
    pub fn new(manager: Arc<ConnectionManager>, audit: AuditTrail, default_timeout: Duration) -> Self {
        Self {
            manager,
            audit,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Send `payload` to `queue` and wait up to `timeout` for the reply.
    ///
    /// Always returns a reply; failures are encoded in it.
    pub async fn call(&self, queue: &str, payload: Payload, timeout: Duration) -> Reply {
        let started = Instant::now();
        let correlation_id = CorrelationId::generate();
        let record = self
            .audit
            .request(Stage::Downstream, queue, &correlation_id, &payload)
            .await;

        let (reply, via) = self.exchange(queue, payload, &correlation_id, timeout).await;

        self.audit.response(record, &reply).await;
        metrics::record_rpc_call(queue, via.as_str(), started);
        tracing::info!(
            queue = %queue,
            correlation_id = %correlation_id,
            outcome = via.as_str(),
            response_code = %reply.response_code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "RPC call resolved"
        );
        reply
    }

    async fn exchange(
        &self,
        queue: &str,
        payload: Payload,
        correlation_id: &CorrelationId,
        timeout: Duration,
    ) -> (Reply, Resolution) {
        let unavailable = || (Reply::failure(ResponseCode::BROKER_UNAVAILABLE), Resolution::SendFailed);

        let Some(connection) = self.manager.connection() else {
            tracing::warn!(queue = %queue, correlation_id = %correlation_id, "No broker connection for RPC call");
            return unavailable();
        };
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(queue = %queue, correlation_id = %correlation_id, error = %e, "Failed to open call channel");
                return unavailable();
            }
        };

        let (pending, outcome) = PendingCall::new(correlation_id.clone(), channel.clone());
        match self
            .send(&pending, &channel, queue, payload, correlation_id, timeout)
            .await
        {
            Ok(()) => pending.arm_timer(timeout),
            Err(e) => {
                tracing::warn!(queue = %queue, correlation_id = %correlation_id, error = %e, "Failed to send work item");
                pending
                    .resolve(Reply::failure(ResponseCode::BROKER_UNAVAILABLE), Resolution::SendFailed)
                    .await;
            }
        }

        outcome.await.unwrap_or_else(|_| unavailable())
    }

    /// Declare and subscribe to a reply queue, then publish the work item.
    async fn send(
        &self,
        pending: &Arc<PendingCall>,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        payload: Payload,
        correlation_id: &CorrelationId,
        timeout: Duration,
    ) -> BrokerResult<()> {
        let reply_queue = channel.declare_reply_queue().await?;
        let subscription = channel.consume(&reply_queue, AckMode::Auto).await?;
        pending.set_subscription(subscription.consumer_tag);
        pending.attach_listener(tokio::spawn(listen_for_reply(
            pending.clone(),
            subscription.deliveries,
        )));

        let item = WorkItem {
            queue: queue.to_string(),
            correlation_id: correlation_id.clone(),
            reply_to: reply_queue,
            expiration: Some(timeout),
            payload,
        };
        channel.publish(queue, item.into_message()?).await
    }
}

/// Resolve `pending` with the first delivery carrying its correlation ID.
async fn listen_for_reply(pending: Arc<PendingCall>, mut deliveries: DeliveryStream) {
    while let Some(delivery) = deliveries.next().await {
        if delivery.properties.correlation_id.as_ref() != Some(pending.correlation_id()) {
            tracing::debug!(
                expected = %pending.correlation_id(),
                received = ?delivery.properties.correlation_id,
                "Ignoring reply for another call"
            );
            continue;
        }

        let reply = match serde_json::from_slice::<Reply>(&delivery.body) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(correlation_id = %pending.correlation_id(), error = %e, "Undecodable reply body");
                Reply::failure(ResponseCode::INVALID_REPLY)
            }
        };
        pending.resolve(reply, Resolution::Replied).await;
        return;
    }

    pending
        .resolve(Reply::failure(ResponseCode::BROKER_UNAVAILABLE), Resolution::ChannelLost)
        .await;
}
