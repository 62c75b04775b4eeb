//! Broker connection lifecycle.
//!
//! # Data Flow
//! ```text
//! Disconnected → Connecting ──connect ok + hook ok──→ Connected
//!      ▲              │                                  │
//!      │         failure: sleep backoff            closed() fires
//!      │              │                                  ▼
//!      └──────────────┴──────────────────────────── Errored
//!
//! shutdown while Connected → Closing → Disconnected (loop exits)
//! ```
//!
//! # Design Decisions
//! - One manager type serves both roles; the consumer plugs in a `SessionHook`
//! - Backoff starts at 2 s, doubles, caps at 30 s, resets after a success
//! - State is published on a watch channel for health checks and tests

pub mod manager;
pub mod state;

pub use manager::{ConnectionManager, SessionHook};
pub use state::ConnectionState;
