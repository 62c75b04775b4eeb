//! Order bridge
//!
//! Broker-mediated RPC between HTTP callers and a rate-limited backend.
//!
//! # Architecture Overview
//!
//! ```text
//!   HTTP caller                                                     Backend
//!       │                                                              ▲
//!       ▼                                                              │
//!  ┌──────────┐   ┌───────────┐      ┌────────┐      ┌─────────────┐  │
//!  │ gateway  │──▶│ RpcClient │─────▶│ broker │─────▶│ RpcConsumer │──┘
//!  │  (axum)  │◀──│ + pending │◀─────│ queues │◀─────│ + limiter   │
//!  └──────────┘   └───────────┘      └────────┘      └─────────────┘
//!        order-bridge gateway                     order-bridge consumer
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use order_bridge::broker::amqp::AmqpBroker;
use order_bridge::broker::Broker;
use order_bridge::config::{load_config, BridgeConfig};
use order_bridge::lifecycle::{startup, wait_for_signal, Shutdown};
use order_bridge::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "order-bridge")]
#[command(about = "Broker-mediated RPC bridge with token-bucket admission", long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(short, long, default_value = "bridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Consume work queues and forward admitted items to the backend
    Consumer,
    /// Serve the HTTP gateway and issue RPC calls
    Gateway,
}

fn read_config(path: &Path) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(load_config(path)?)
    } else {
        Ok(BridgeConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = read_config(&cli.config)?;

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "order-bridge starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(&config.broker));
    let shutdown = Shutdown::new();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.trigger();
    });

    match cli.role {
        Role::Consumer => {
            let (_manager, handle) = startup::start_consumer(&config, broker, &shutdown).await?;
            handle.await?;
        }
        Role::Gateway => {
            let (client, handle) = startup::start_client(&config, broker, &shutdown).await?;
            let served = startup::run_gateway(&config, client, shutdown.clone()).await;
            shutdown.trigger();
            handle.await?;
            served?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
