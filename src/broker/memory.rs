//! In-process broker.
//!
//! Mirrors the AMQP behaviour the bridge relies on: durable named queues,
//! exclusive auto-deleted reply queues, per-message expiration, manual
//! acknowledgement with one unacknowledged delivery per subscription, and
//! requeue-as-redelivered when a channel closes with a delivery outstanding.
//! Reachability can be toggled and live connections severed to simulate
//! outages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{
    AckMode, Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult,
    Delivery, MessageProperties, OutboundMessage, Subscription,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of broker activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connections_opened: usize,
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub consumers_started: usize,
    pub consumers_cancelled: usize,
    pub published: usize,
    pub expired: usize,
    pub unroutable: usize,
}

#[derive(Default)]
struct Counters {
    connections_opened: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    consumers_started: AtomicUsize,
    consumers_cancelled: AtomicUsize,
    published: AtomicUsize,
    expired: AtomicUsize,
    unroutable: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Queued {
    properties: MessageProperties,
    body: Vec<u8>,
    enqueued_at: Instant,
    redelivered: bool,
}

impl Queued {
    fn is_expired(&self, now: Instant) -> bool {
        self.properties
            .expiration
            .is_some_and(|ttl| now.saturating_duration_since(self.enqueued_at) >= ttl)
    }
}

struct MemoryQueue {
    name: String,
    /// Channel that owns an exclusive queue.
    exclusive_to: Option<u64>,
    auto_delete: bool,
    messages: Mutex<VecDeque<Queued>>,
    ready: Notify,
    consumers: AtomicUsize,
}

impl MemoryQueue {
    fn push(&self, message: Queued) {
        lock(&self.messages).push_back(message);
        self.ready.notify_one();
    }

    fn push_front(&self, message: Queued) {
        lock(&self.messages).push_front(message);
        self.ready.notify_one();
    }

    fn pop(&self, counters: &Counters) -> Option<Queued> {
        let now = Instant::now();
        let mut messages = lock(&self.messages);
        while let Some(message) = messages.pop_front() {
            if message.is_expired(now) {
                bump(&counters.expired);
                tracing::debug!(queue = %self.name, "Dropping expired message");
                continue;
            }
            return Some(message);
        }
        None
    }

    fn purge_expired(&self, counters: &Counters) -> usize {
        let now = Instant::now();
        let mut messages = lock(&self.messages);
        let before = messages.len();
        messages.retain(|m| !m.is_expired(now));
        for _ in messages.len()..before {
            bump(&counters.expired);
        }
        messages.len()
    }
}

struct BrokerState {
    reachable: AtomicBool,
    next_id: AtomicU64,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    connect_attempts: Mutex<Vec<Instant>>,
    counters: Counters,
}

impl BrokerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.queues).get(name).cloned()
    }

    fn declare(&self, name: &str, exclusive_to: Option<u64>, auto_delete: bool) -> Arc<MemoryQueue> {
        lock(&self.queues)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryQueue {
                    name: name.to_string(),
                    exclusive_to,
                    auto_delete,
                    messages: Mutex::new(VecDeque::new()),
                    ready: Notify::new(),
                    consumers: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    fn delete_queue(&self, name: &str) {
        if let Some(queue) = lock(&self.queues).remove(name) {
            let dropped = lock(&queue.messages).len();
            if dropped > 0 {
                tracing::debug!(queue = %name, dropped, "Deleted queue with pending messages");
            }
        }
    }
}

/// In-process broker. Cloning shares the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                reachable: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                queues: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                connect_attempts: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// While unreachable, every connect attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Close every live connection as if the broker had dropped them.
    /// Returns the number of connections severed.
    pub fn sever_connections(&self) -> usize {
        let connections: Vec<_> = std::mem::take(&mut *lock(&self.state.connections))
            .into_iter()
            .filter_map(|weak| weak.upgrade())
            .collect();
        let mut severed = 0;
        for connection in connections {
            if connection.shutdown() {
                severed += 1;
            }
        }
        tracing::info!(severed, "Severed memory broker connections");
        severed
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state.connections)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_connected())
            .count()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queue(name).is_some()
    }

    /// Names of every declared queue, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.state.queues).keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of ready (undelivered, unexpired) messages on a queue.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state
            .queue(name)
            .map(|q| q.purge_expired(&self.state.counters))
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .queue(name)
            .map(|q| q.consumers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Timestamps of every connect attempt, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.state.connect_attempts).clone()
    }

    pub fn stats(&self) -> MemoryStats {
        let c = &self.state.counters;
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        MemoryStats {
            connections_opened: load(&c.connections_opened),
            channels_opened: load(&c.channels_opened),
            channels_closed: load(&c.channels_closed),
            consumers_started: load(&c.consumers_started),
            consumers_cancelled: load(&c.consumers_cancelled),
            published: load(&c.published),
            expired: load(&c.expired),
            unroutable: load(&c.unroutable),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        lock(&self.state.connect_attempts).push(Instant::now());
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable(
                "memory broker is unreachable".to_string(),
            ));
        }

        let (closed_tx, _) = watch::channel(false);
        let connection = Arc::new(MemoryConnection {
            state: self.state.clone(),
            closed_tx,
            channels: Mutex::new(Vec::new()),
        });
        bump(&self.state.counters.connections_opened);

        let mut connections = lock(&self.state.connections);
        connections.retain(|weak| weak.strong_count() > 0);
        connections.push(Arc::downgrade(&connection));
        Ok(connection)
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    closed_tx: watch::Sender<bool>,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
}

impl MemoryConnection {
    /// Returns false if the connection was already closed.
    fn shutdown(&self) -> bool {
        if self.closed_tx.send_replace(true) {
            return false;
        }
        let channels = std::mem::take(&mut *lock(&self.channels));
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.shutdown();
        }
        true
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(BrokerError::ConnectionClosed);
        }
        let channel = Arc::new(MemoryChannel {
            id: self.state.next_id(),
            state: self.state.clone(),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
            consumers: Mutex::new(HashMap::new()),
            owned_queues: Mutex::new(Vec::new()),
        });
        bump(&self.state.counters.channels_opened);

        let mut channels = lock(&self.channels);
        channels.retain(|weak| weak.strong_count() > 0);
        channels.push(Arc::downgrade(&channel));
        Ok(channel)
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shutdown();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !*self.closed_tx.borrow()
    }
}

struct ActiveConsumer {
    queue: Arc<MemoryQueue>,
    stop: watch::Sender<bool>,
}

struct MemoryChannel {
    id: u64,
    state: Arc<BrokerState>,
    open: AtomicBool,
    prefetch: AtomicU16,
    consumers: Mutex<HashMap<String, ActiveConsumer>>,
    owned_queues: Mutex<Vec<String>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn stop_consumer(&self, consumer: ActiveConsumer) {
        let _ = consumer.stop.send(true);
        let remaining = consumer.queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        bump(&self.state.counters.consumers_cancelled);
        if consumer.queue.auto_delete && remaining == 0 {
            self.state.delete_queue(&consumer.queue.name);
        }
    }

    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for (_, consumer) in consumers {
            self.stop_consumer(consumer);
        }
        let owned = std::mem::take(&mut *lock(&self.owned_queues));
        for name in owned {
            self.state.delete_queue(&name);
        }
        bump(&self.state.counters.channels_closed);
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        self.state.declare(name, None, false);
        Ok(())
    }

    async fn declare_reply_queue(&self) -> BrokerResult<String> {
        self.ensure_open()?;
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.state.declare(&name, Some(self.id), true);
        lock(&self.owned_queues).push(name.clone());
        Ok(name)
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> BrokerResult<Subscription> {
        self.ensure_open()?;
        let target = self
            .state
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if target.exclusive_to.is_some_and(|owner| owner != self.id) {
            return Err(BrokerError::Protocol(format!(
                "queue {queue} is exclusive to another channel"
            )));
        }

        let consumer_tag = format!("ctag-{}", Uuid::new_v4().simple());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (delivery_tx, delivery_rx) = mpsc::channel(1);

        target.consumers.fetch_add(1, Ordering::SeqCst);
        bump(&self.state.counters.consumers_started);
        lock(&self.consumers).insert(
            consumer_tag.clone(),
            ActiveConsumer {
                queue: target.clone(),
                stop: stop_tx,
            },
        );
        tokio::spawn(dispatch(
            target,
            mode,
            delivery_tx,
            stop_rx,
            self.state.clone(),
        ));

        let deliveries = stream::unfold(delivery_rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Subscription {
            consumer_tag,
            queue: queue.to_string(),
            deliveries: Box::pin(deliveries),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let consumer = lock(&self.consumers)
            .remove(consumer_tag)
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer_tag.to_string()))?;
        self.stop_consumer(consumer);
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> BrokerResult<()> {
        self.ensure_open()?;
        bump(&self.state.counters.published);
        match self.state.queue(queue) {
            Some(target) => target.push(Queued {
                properties: message.properties,
                body: message.body,
                enqueued_at: Instant::now(),
                redelivered: false,
            }),
            None => {
                bump(&self.state.counters.unroutable);
                tracing::debug!(queue = %queue, "Dropping unroutable message");
            }
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shutdown();
        Ok(())
    }
}

struct MemoryAcker {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        let tx = lock(&self.tx).take().ok_or(BrokerError::ChannelClosed)?;
        tx.send(()).map_err(|_| BrokerError::ChannelClosed)
    }
}

async fn next_message(queue: &MemoryQueue, counters: &Counters) -> Queued {
    loop {
        let ready = queue.ready.notified();
        if let Some(message) = queue.pop(counters) {
            return message;
        }
        ready.await;
    }
}

/// Feeds one subscription. Manual-ack subscriptions hold at most one
/// unacknowledged delivery.
async fn dispatch(
    queue: Arc<MemoryQueue>,
    mode: AckMode,
    tx: mpsc::Sender<Delivery>,
    mut stop: watch::Receiver<bool>,
    state: Arc<BrokerState>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return,
            message = next_message(&queue, &state.counters) => message,
        };

        let (acker, ack_rx) = match mode {
            AckMode::Manual => {
                let (ack_tx, ack_rx) = oneshot::channel();
                let acker: Box<dyn Acknowledger> = Box::new(MemoryAcker {
                    tx: Mutex::new(Some(ack_tx)),
                });
                (Some(acker), Some(ack_rx))
            }
            AckMode::Auto => (None, None),
        };
        let delivery = Delivery::new(
            message.properties.clone(),
            message.body.clone(),
            message.redelivered,
            acker,
        );

        let sent = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => false,
            sent = tx.send(delivery) => sent.is_ok(),
        };
        if !sent {
            // Never reached a handler: put it back untouched.
            queue.push_front(message);
            return;
        }

        let Some(ack_rx) = ack_rx else { continue };
        let redeliver = Queued {
            redelivered: true,
            ..message
        };
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => {
                queue.push_front(redeliver);
                return;
            }
            acked = ack_rx => {
                if acked.is_err() {
                    queue.push_front(redeliver);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn open(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let connection = broker.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        (connection, channel)
    }

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage::new(MessageProperties::default(), body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(matches!(
            broker.connect().await,
            Err(BrokerError::Unreachable(_))
        ));
        assert_eq!(broker.connect_attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_is_dropped() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel.publish("nowhere", message("{}")).await.unwrap();
        assert_eq!(broker.stats().unroutable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel.declare_queue("check-status", true).await.unwrap();

        let props = MessageProperties::default().with_expiration(Duration::from_millis(50));
        channel
            .publish("check-status", OutboundMessage::new(props, b"{}".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("check-status"), Some(1));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(broker.queue_depth("check-status"), Some(0));
        assert_eq!(broker.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_reply_queue_deleted_on_cancel() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        let reply_queue = channel.declare_reply_queue().await.unwrap();
        let subscription = channel.consume(&reply_queue, AckMode::Auto).await.unwrap();
        assert_eq!(broker.consumer_count(&reply_queue), 1);

        channel.cancel(&subscription.consumer_tag).await.unwrap();
        assert!(!broker.queue_exists(&reply_queue));
        assert_eq!(broker.stats().consumers_cancelled, 1);
    }

    #[tokio::test]
    async fn test_reply_queue_is_exclusive() {
        let broker = MemoryBroker::new();
        let (conn, channel) = open(&broker).await;
        let reply_queue = channel.declare_reply_queue().await.unwrap();
        let other = conn.open_channel().await.unwrap();
        assert!(other.consume(&reply_queue, AckMode::Auto).await.is_err());
    }

    #[tokio::test]
    async fn test_manual_ack_gates_next_delivery() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel.declare_queue("create-order", true).await.unwrap();
        channel.publish("create-order", message("1")).await.unwrap();
        channel.publish("create-order", message("2")).await.unwrap();

        let mut sub = channel.consume("create-order", AckMode::Manual).await.unwrap();
        let first = sub.deliveries.next().await.unwrap();
        assert_eq!(first.body, b"1");

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), sub.deliveries.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        first.ack().await.unwrap();
        let second = sub.deliveries.next().await.unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered_after_channel_close() {
        let broker = MemoryBroker::new();
        let (conn, channel) = open(&broker).await;
        channel.declare_queue("create-order", true).await.unwrap();
        channel.publish("create-order", message("1")).await.unwrap();

        let mut sub = channel.consume("create-order", AckMode::Manual).await.unwrap();
        let first = sub.deliveries.next().await.unwrap();
        assert!(!first.redelivered);
        channel.close().await.unwrap();
        drop(first);

        let other = conn.open_channel().await.unwrap();
        let mut sub = other.consume("create-order", AckMode::Manual).await.unwrap();
        let again = sub.deliveries.next().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, b"1");
    }

    #[tokio::test]
    async fn test_sever_closes_connections() {
        let broker = MemoryBroker::new();
        let (conn, channel) = open(&broker).await;
        assert_eq!(broker.open_connections(), 1);

        assert_eq!(broker.sever_connections(), 1);
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("closed() should resolve after sever");
        assert!(!conn.is_connected());
        assert!(conn.open_channel().await.is_err());
        assert!(matches!(
            channel.publish("q", message("{}")).await,
            Err(BrokerError::ChannelClosed)
        ));
    }
}
