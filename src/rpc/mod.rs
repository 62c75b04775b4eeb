//! Broker-mediated RPC.
//!
//! # Data Flow
//! ```text
//! RpcClient::call(queue, payload, timeout)
//!     → open channel, declare exclusive reply queue, subscribe
//!     → publish WorkItem {correlation_id, reply_to, expiration}
//!     → arm timer
//!                    ... broker ...
//! RpcConsumer (one QueueWorker per queue, prefetch 1)
//!     → decode (malformed → ack, drop)
//!     → BucketRegistry::try_admit (rejected → overload reply)
//!     → Backend::invoke → success / error reply
//!     → ack
//!                    ... broker ...
//! reply listener (matching correlation_id) ─┐
//! timer                                     ├─→ PendingCall::resolve (first wins)
//! send failure                              ┘       → cleanup once → caller
//! ```
//!
//! # Design Decisions
//! - One parameterized client/consumer pair serves every queue
//! - At-most-once: deliveries are always acked, never requeued
//! - A timed-out call does not cancel the backend work it triggered; the late
//!   reply finds its reply queue gone and is dropped by the broker

pub mod client;
pub mod consumer;
pub mod envelope;
pub mod pending;

pub use client::RpcClient;
pub use consumer::{Handled, QueueRoute, QueueWorker, RpcConsumer};
pub use envelope::{Payload, Reply, ResponseCode, WorkItem};
pub use pending::{PendingCall, Resolution};
