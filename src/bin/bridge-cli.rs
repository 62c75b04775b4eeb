use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;

use order_bridge::broker::amqp::AmqpBroker;
use order_bridge::config::{load_config, BridgeConfig, ConfigError};
use order_bridge::lifecycle::{startup, Shutdown};

#[derive(Parser)]
#[command(name = "bridge-cli")]
#[command(about = "Command-line client for the order bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue one RPC call and print the reply
    Call {
        /// Target queue, e.g. check-status
        queue: String,
        /// JSON object payload
        payload: String,
        /// Overrides rpc.timeout_ms from the config
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(short, long, default_value = "bridge.toml")]
        config: PathBuf,
    },
    /// Configuration utilities
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Parse and validate a configuration file
    Check { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Call {
            queue,
            payload,
            timeout_ms,
            config,
        } => call(queue, &payload, timeout_ms, config).await,
        Commands::Config {
            command: ConfigCommands::Check { path },
        } => check(path),
    }
}

async fn call(
    queue: String,
    payload: &str,
    timeout_ms: Option<u64>,
    config_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = if config_path.exists() {
        load_config(&config_path)?
    } else {
        BridgeConfig::default()
    };
    let payload = match serde_json::from_str::<Value>(payload)? {
        Value::Object(map) => map,
        _ => return Err("payload must be a JSON object".into()),
    };
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.rpc.timeout());

    let shutdown = Shutdown::new();
    let broker = Arc::new(AmqpBroker::new(&config.broker));
    let (client, handle) = startup::start_client(&config, broker, &shutdown).await?;

    if !client.manager().wait_until_connected(timeout).await {
        eprintln!("Warning: broker not connected after {:?}", timeout);
    }
    let reply = client.call(&queue, payload, timeout).await;
    println!("{}", serde_json::to_string_pretty(&reply)?);

    shutdown.trigger();
    handle.await?;
    Ok(())
}

fn check(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match load_config(&path) {
        Ok(config) => {
            println!(
                "{}: OK ({} queues, {} buckets)",
                path.display(),
                config.queues.len(),
                config.buckets.len()
            );
            Ok(())
        }
        Err(ConfigError::Validation(errors)) => {
            eprintln!("{}: {} problem(s)", path.display(), errors.len());
            for error in &errors {
                eprintln!("  {error}");
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
