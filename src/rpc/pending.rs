//! Single-assignment resolution cell for one in-flight call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::broker::{BrokerChannel, CorrelationId};
use crate::rpc::envelope::Reply;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What decided a call's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A reply with the call's correlation ID arrived.
    Replied,
    /// The deadline passed first.
    TimedOut,
    /// No connection, or declare/subscribe/publish failed.
    SendFailed,
    /// The reply subscription ended without a matching reply.
    ChannelLost,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Replied => "replied",
            Resolution::TimedOut => "timed_out",
            Resolution::SendFailed => "send_failed",
            Resolution::ChannelLost => "channel_lost",
        }
    }

    /// Triggers that fire on the reply listener task itself.
    fn from_listener(self) -> bool {
        matches!(self, Resolution::Replied | Resolution::ChannelLost)
    }
}

/// Client-side record of an in-flight call.
///
/// The reply listener, the timer and the caller's own send path race to
/// resolve it. A compare-and-swap on `resolved` lets exactly one of them win;
/// the winner runs cleanup once (stop the other trigger, cancel the reply
/// subscription, close the call's channel) and hands the reply to the waiter.
pub struct PendingCall {
    correlation_id: CorrelationId,
    channel: Arc<dyn BrokerChannel>,
    resolved: AtomicBool,
    outcome_tx: Mutex<Option<oneshot::Sender<(Reply, Resolution)>>>,
    consumer_tag: Mutex<Option<String>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PendingCall {
    pub fn new(
        correlation_id: CorrelationId,
        channel: Arc<dyn BrokerChannel>,
    ) -> (Arc<Self>, oneshot::Receiver<(Reply, Resolution)>) {
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(Self {
            correlation_id,
            channel,
            resolved: AtomicBool::new(false),
            outcome_tx: Mutex::new(Some(tx)),
            consumer_tag: Mutex::new(None),
            listener: Mutex::new(None),
            timer: Mutex::new(None),
        });
        (call, rx)
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    pub fn set_subscription(&self, consumer_tag: String) {
        *lock(&self.consumer_tag) = Some(consumer_tag);
    }

    pub fn attach_listener(&self, handle: JoinHandle<()>) {
        *lock(&self.listener) = Some(handle);
    }

    /// Start the deadline. Does nothing if the call already resolved.
    pub fn arm_timer(self: &Arc<Self>, timeout: Duration) {
        if self.is_resolved() {
            return;
        }
        let call = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            call.resolve(Reply::timed_out(), Resolution::TimedOut).await;
        });
        *lock(&self.timer) = Some(handle);
        // Lost a race with a resolution that found no timer to stop.
        if self.is_resolved() {
            if let Some(handle) = lock(&self.timer).take() {
                handle.abort();
            }
        }
    }

    /// Resolve the call. Returns false if another trigger already won.
    pub async fn resolve(&self, reply: Reply, via: Resolution) -> bool {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::trace!(
                correlation_id = %self.correlation_id,
                via = via.as_str(),
                "Call already resolved"
            );
            return false;
        }

        self.release(via).await;

        let outcome_tx = lock(&self.outcome_tx).take();
        if let Some(tx) = outcome_tx {
            let _ = tx.send((reply, via));
        }
        true
    }

    /// Runs exactly once, on the winning trigger.
    async fn release(&self, via: Resolution) {
        // The winning task must not abort itself.
        if via != Resolution::TimedOut {
            let timer = lock(&self.timer).take();
            if let Some(timer) = timer {
                timer.abort();
            }
        }
        if !via.from_listener() {
            let listener = lock(&self.listener).take();
            if let Some(listener) = listener {
                listener.abort();
            }
        }

        let consumer_tag = lock(&self.consumer_tag).take();
        if let Some(tag) = consumer_tag {
            if let Err(e) = self.channel.cancel(&tag).await {
                tracing::debug!(correlation_id = %self.correlation_id, error = %e, "Failed to cancel reply subscription");
            }
        }
        if let Err(e) = self.channel.close().await {
            tracing::debug!(correlation_id = %self.correlation_id, error = %e, "Failed to close call channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AckMode, BrokerResult, OutboundMessage, Subscription};
    use crate::rpc::envelope::ResponseCode;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingChannel {
        cancels: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl BrokerChannel for CountingChannel {
        async fn set_prefetch(&self, _count: u16) -> BrokerResult<()> {
            Ok(())
        }
        async fn declare_queue(&self, _name: &str, _durable: bool) -> BrokerResult<()> {
            Ok(())
        }
        async fn declare_reply_queue(&self) -> BrokerResult<String> {
            Ok("amq.gen-test".to_string())
        }
        async fn consume(&self, _queue: &str, _mode: AckMode) -> BrokerResult<Subscription> {
            unimplemented!("not used by these tests")
        }
        async fn cancel(&self, _consumer_tag: &str) -> BrokerResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(())
        }
        async fn publish(&self, _queue: &str, _message: OutboundMessage) -> BrokerResult<()> {
            Ok(())
        }
        async fn close(&self) -> BrokerResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pending(channel: Arc<CountingChannel>) -> (Arc<PendingCall>, oneshot::Receiver<(Reply, Resolution)>) {
        let (call, rx) = PendingCall::new(CorrelationId::generate(), channel);
        call.set_subscription("ctag-1".to_string());
        (call, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_trigger_wins() {
        for _ in 0..50 {
            let channel = Arc::new(CountingChannel::default());
            let (call, rx) = pending(channel.clone());

            let a = {
                let call = call.clone();
                tokio::spawn(async move { call.resolve(Reply::success(serde_json::json!(1)), Resolution::Replied).await })
            };
            let b = {
                let call = call.clone();
                tokio::spawn(async move { call.resolve(Reply::timed_out(), Resolution::TimedOut).await })
            };
            let (a, b) = (a.await.unwrap(), b.await.unwrap());

            assert!(a ^ b, "exactly one resolve must win");
            assert_eq!(channel.cancels.load(Ordering::SeqCst), 1);
            assert_eq!(channel.closes.load(Ordering::SeqCst), 1);

            let (reply, via) = rx.await.unwrap();
            if a {
                assert_eq!(via, Resolution::Replied);
                assert!(reply.is_success());
            } else {
                assert_eq!(via, Resolution::TimedOut);
                assert_eq!(reply.response_code(), ResponseCode::RPC_TIMEOUT);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_resolves_with_timeout() {
        let channel = Arc::new(CountingChannel::default());
        let (call, rx) = pending(channel.clone());
        call.arm_timer(Duration::from_millis(100));

        let (reply, via) = rx.await.unwrap();
        assert_eq!(via, Resolution::TimedOut);
        assert_eq!(reply, Reply::timed_out());
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_stops_timer() {
        let channel = Arc::new(CountingChannel::default());
        let (call, rx) = pending(channel.clone());
        call.arm_timer(Duration::from_millis(100));

        assert!(call.resolve(Reply::success(serde_json::json!({})), Resolution::Replied).await);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (_, via) = rx.await.unwrap();
        assert_eq!(via, Resolution::Replied);
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timer_not_armed_after_resolution() {
        let channel = Arc::new(CountingChannel::default());
        let (call, _rx) = pending(channel.clone());
        call.resolve(Reply::failure(ResponseCode::BROKER_UNAVAILABLE), Resolution::SendFailed)
            .await;
        call.arm_timer(Duration::from_millis(1));
        assert!(lock(&call.timer).is_none());
    }
}
