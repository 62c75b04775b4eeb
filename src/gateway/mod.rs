//! HTTP gateway in front of the client role.
//!
//! # Responsibilities
//! - Map configured POST paths to queues
//! - Reject bodies that are not JSON objects
//! - Report broker connectivity on `/health`

pub mod server;

use thiserror::Error;

pub use server::{build_router, GatewayServer, GatewayState};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bind address {0}")]
    BindAddress(String),
}
