//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use order_bridge::audit::{AuditTrail, MemoryRecorder};
use order_bridge::backend::{Backend, BackendError};
use order_bridge::broker::memory::MemoryBroker;
use order_bridge::config::BridgeConfig;
use order_bridge::connection::ConnectionManager;
use order_bridge::lifecycle::Shutdown;
use order_bridge::limiter::BucketRegistry;
use order_bridge::resilience::BackoffPolicy;
use order_bridge::rpc::{Payload, QueueRoute, Reply, RpcClient, RpcConsumer};

/// Read one HTTP/1.1 request (headers plus `Content-Length` body).
async fn read_request(socket: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return buf,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + length {
            return buf[end + 4..end + 4 + length].to_vec();
        }
    }
}

/// Start a programmable mock backend on an ephemeral port.
///
/// `f` receives the request body and returns the status and JSON body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let body = read_request(&mut socket).await;
                        let (status, body) = f(body).await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            422 => "422 Unprocessable Entity",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// In-process backend with a call counter.
///
/// Echoes the payload back unless configured to fail.
#[derive(Default)]
pub struct StubBackend {
    calls: AtomicUsize,
    endpoints: Mutex<Vec<String>>,
    failure: Option<Value>,
    delay: Option<Duration>,
}

impl StubBackend {
    pub fn echo() -> Self {
        Self::default()
    }

    /// Every call fails with a 500 carrying `detail`.
    pub fn failing(detail: Value) -> Self {
        Self {
            failure: Some(detail),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for StubBackend {
    async fn invoke(&self, endpoint: &str, payload: &Payload) -> Result<Value, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(detail) => Err(BackendError::Status {
                status: 500,
                body: detail.clone(),
            }),
            None => Ok(Value::Object(payload.clone())),
        }
    }
}

/// Default config with fast reconnects and a short call timeout.
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.broker.initial_backoff_ms = 10;
    config.broker.max_backoff_ms = 50;
    config.rpc.timeout_ms = 2_000;
    config
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

/// Both bridge roles wired to one memory broker.
pub struct Harness {
    pub broker: MemoryBroker,
    pub shutdown: Shutdown,
    pub backend: Arc<StubBackend>,
    pub consumer: Arc<ConnectionManager>,
    pub client: Arc<RpcClient>,
    pub client_audit: Arc<MemoryRecorder>,
    pub consumer_audit: Arc<MemoryRecorder>,
}

impl Harness {
    pub async fn start(config: BridgeConfig, backend: StubBackend) -> Self {
        let registry = BucketRegistry::from_config(&config.buckets, &config.queues).unwrap();
        Self::start_with_registry(config, backend, registry).await
    }

    pub async fn start_with_registry(
        config: BridgeConfig,
        backend: StubBackend,
        registry: BucketRegistry,
    ) -> Self {
        let broker = MemoryBroker::new();
        let shutdown = Shutdown::new();
        let backend = Arc::new(backend);
        let client_audit = Arc::new(MemoryRecorder::new());
        let consumer_audit = Arc::new(MemoryRecorder::new());
        let policy = BackoffPolicy::from(&config.broker);

        let hook = RpcConsumer::new(
            QueueRoute::from_config(&config).unwrap(),
            Arc::new(registry),
            backend.clone(),
            AuditTrail::new(consumer_audit.clone()),
            config.broker.prefetch,
        );
        let consumer = Arc::new(
            ConnectionManager::new("consumer", Arc::new(broker.clone()), policy)
                .with_hook(Arc::new(hook)),
        );
        tokio::spawn(consumer.clone().run(shutdown.subscribe()));

        let client_manager = Arc::new(ConnectionManager::new(
            "client",
            Arc::new(broker.clone()),
            policy,
        ));
        tokio::spawn(client_manager.clone().run(shutdown.subscribe()));
        let client = Arc::new(RpcClient::new(
            client_manager,
            AuditTrail::new(client_audit.clone()),
            config.rpc.timeout(),
        ));

        assert!(consumer.wait_until_connected(Duration::from_secs(2)).await);
        assert!(client
            .manager()
            .wait_until_connected(Duration::from_secs(2))
            .await);

        Self {
            broker,
            shutdown,
            backend,
            consumer,
            client,
            client_audit,
            consumer_audit,
        }
    }

    pub async fn call(&self, queue: &str, body: Value) -> Reply {
        self.client
            .call(queue, payload(body), self.client.default_timeout())
            .await
    }

    /// Wait until both roles report a live session again.
    pub async fn wait_connected(&self) -> bool {
        self.consumer.wait_until_connected(Duration::from_secs(2)).await
            && self
                .client
                .manager()
                .wait_until_connected(Duration::from_secs(2))
                .await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
