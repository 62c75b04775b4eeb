//! Admission control for consumed work.
//!
//! # Data Flow
//! ```text
//! delivery on queue Q
//!     → BucketRegistry::try_admit(Q)
//!         → bucket assigned to Q? (none → Unlimited)
//!         → TokenBucket::try_consume(1)
//!     → Admitted (forward to backend) | Rejected (overload reply)
//! ```
//!
//! # Design Decisions
//! - Buckets are built once from validated config and injected; no global state
//! - Refill is lazy, computed from elapsed time on each attempt
//! - Rejection never blocks or queues

pub mod registry;
pub mod token_bucket;

pub use registry::{Admission, BucketRegistry, RegistryError};
pub use token_bucket::TokenBucket;
