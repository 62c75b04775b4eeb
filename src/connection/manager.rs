//! Broker connection manager.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::broker::{Broker, BrokerConnection, BrokerResult};
use crate::connection::state::ConnectionState;
use crate::observability::metrics;
use crate::resilience::{Backoff, BackoffPolicy};

/// Work to run on every freshly established connection, before the manager
/// reports `Connected`. The consumer role uses it to re-subscribe its queues.
#[async_trait]
pub trait SessionHook: Send + Sync {
    async fn on_connected(&self, connection: Arc<dyn BrokerConnection>) -> BrokerResult<()>;
}

/// Keeps one broker session alive for a process role.
///
/// `run` connects, invokes the session hook, waits for the connection to
/// close, and starts over. Failed attempts are logged and retried after an
/// exponential backoff; nothing is surfaced to the caller. A new session is
/// created on every cycle and the previous one is never reused.
pub struct ConnectionManager {
    role: &'static str,
    broker: Arc<dyn Broker>,
    policy: BackoffPolicy,
    hook: Option<Arc<dyn SessionHook>>,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(role: &'static str, broker: Arc<dyn Broker>, policy: BackoffPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            role,
            broker,
            policy,
            hook: None,
            current: RwLock::new(None),
            state_tx,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The live connection, if the manager is connected.
    pub fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.is_connected())
            .cloned()
    }

    /// Wait until the manager reports `Connected`. Returns false on timeout.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.is_connected()))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(role = self.role, from = %previous, to = %state, "Connection state changed");
        }
        metrics::record_broker_connected(self.role, state.is_connected());
    }

    fn set_current(&self, connection: Option<Arc<dyn BrokerConnection>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = connection;
    }

    async fn establish(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let connection = self.broker.connect().await?;
        if let Some(hook) = &self.hook {
            if let Err(e) = hook.on_connected(connection.clone()).await {
                if let Err(close_err) = connection.close().await {
                    tracing::debug!(role = self.role, error = %close_err, "Failed to close half-initialised connection");
                }
                return Err(e);
            }
        }
        Ok(connection)
    }

    /// Run the connect/reconnect loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.policy);

        loop {
            self.set_state(ConnectionState::Connecting);
            tracing::info!(role = self.role, broker = %self.broker.describe(), "Connecting to broker");

            let connection = tokio::select! {
                result = self.establish() => result,
                _ = shutdown.recv() => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            };

            match connection {
                Ok(connection) => {
                    backoff.reset();
                    self.set_current(Some(connection.clone()));
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(role = self.role, "Broker session established");

                    tokio::select! {
                        _ = connection.closed() => {
                            self.set_current(None);
                            self.set_state(ConnectionState::Errored);
                            metrics::record_reconnect(self.role);
                            tracing::warn!(role = self.role, "Broker connection closed. Reconnecting...");
                        }
                        _ = shutdown.recv() => {
                            self.set_state(ConnectionState::Closing);
                            self.set_current(None);
                            if let Err(e) = connection.close().await {
                                tracing::warn!(role = self.role, error = %e, "Error closing broker connection");
                            }
                            self.set_state(ConnectionState::Disconnected);
                            tracing::info!(role = self.role, "Broker session released");
                            return;
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    self.set_state(ConnectionState::Disconnected);
                    tracing::error!(
                        role = self.role,
                        error = %e,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Broker connection failed. Retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => return,
                    }
                }
            }
        }
    }
}
