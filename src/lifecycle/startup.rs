//! Startup orchestration for the two bridge roles.
//!
//! # Responsibilities
//! - Build subsystems from a validated `BridgeConfig`
//! - Start the connection manager for each role
//! - Bind the gateway listener last, so traffic only arrives once wired up
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The broker is passed in, so tests run both roles against `MemoryBroker`

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::audit::{AuditError, AuditTrail, FileRecorder};
use crate::backend::{Backend, BackendError, HttpBackend};
use crate::broker::Broker;
use crate::config::{AuditConfig, BridgeConfig, ConfigError};
use crate::connection::ConnectionManager;
use crate::gateway::{GatewayError, GatewayServer};
use crate::lifecycle::Shutdown;
use crate::limiter::{BucketRegistry, RegistryError};
use crate::resilience::backoff::BackoffPolicy;
use crate::rpc::{QueueRoute, RpcClient, RpcConsumer};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Open the configured audit sink, or a no-op trail when auditing is off.
pub async fn build_audit(config: &AuditConfig) -> Result<AuditTrail, StartupError> {
    let path = match &config.path {
        Some(path) if config.enabled => path,
        _ => return Ok(AuditTrail::disabled()),
    };
    let recorder = FileRecorder::open(path).await?;
    tracing::info!(path = %path, "Audit trail enabled");
    Ok(AuditTrail::new(Arc::new(recorder)))
}

/// Assemble the consumer hook with its limiter and backend.
pub fn build_consumer(
    config: &BridgeConfig,
    backend: Arc<dyn Backend>,
    audit: AuditTrail,
) -> Result<RpcConsumer, StartupError> {
    let registry = BucketRegistry::from_config(&config.buckets, &config.queues)?;
    let routes = QueueRoute::from_config(config)?;
    Ok(RpcConsumer::new(
        routes,
        Arc::new(registry),
        backend,
        audit,
        config.broker.prefetch,
    ))
}

/// Start the consumer role: a managed session that re-subscribes every queue
/// after each reconnect.
pub async fn start_consumer(
    config: &BridgeConfig,
    broker: Arc<dyn Broker>,
    shutdown: &Shutdown,
) -> Result<(Arc<ConnectionManager>, JoinHandle<()>), StartupError> {
    let audit = build_audit(&config.audit).await?;
    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(&config.backend)?);
    let consumer = build_consumer(config, backend, audit)?;

    let manager = Arc::new(
        ConnectionManager::new("consumer", broker, BackoffPolicy::from(&config.broker))
            .with_hook(Arc::new(consumer)),
    );
    let handle = tokio::spawn(manager.clone().run(shutdown.subscribe()));
    Ok((manager, handle))
}

/// Start the client role's connection manager and wrap it in an `RpcClient`.
pub async fn start_client(
    config: &BridgeConfig,
    broker: Arc<dyn Broker>,
    shutdown: &Shutdown,
) -> Result<(Arc<RpcClient>, JoinHandle<()>), StartupError> {
    let audit = build_audit(&config.audit).await?;
    let manager = Arc::new(ConnectionManager::new(
        "client",
        broker,
        BackoffPolicy::from(&config.broker),
    ));
    let handle = tokio::spawn(manager.clone().run(shutdown.subscribe()));
    let client = Arc::new(RpcClient::new(manager, audit, config.rpc.timeout()));
    Ok((client, handle))
}

/// Run the gateway in front of a started client until shutdown.
pub async fn run_gateway(
    config: &BridgeConfig,
    client: Arc<RpcClient>,
    shutdown: Shutdown,
) -> Result<(), StartupError> {
    let listener = TcpListener::bind(&config.gateway.bind_address)
        .await
        .map_err(|e| GatewayError::BindAddress(format!("{}: {e}", config.gateway.bind_address)))?;
    GatewayServer::new(&config.gateway, client)
        .run(listener, shutdown)
        .await?;
    Ok(())
}
