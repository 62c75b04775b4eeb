//! Order bridge library.
//!
//! Puts a message broker between callers and a slow backend so the backend
//! only sees the load its token buckets admit.

// Broker plumbing
pub mod broker;
pub mod connection;
pub mod rpc;

// Consumer side
pub mod backend;
pub mod limiter;

// Client side
pub mod gateway;

// Cross-cutting concerns
pub mod audit;
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::BridgeConfig;
pub use lifecycle::Shutdown;
pub use rpc::{Reply, ResponseCode, RpcClient, RpcConsumer};
