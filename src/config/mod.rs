//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BridgeConfig (validated, immutable)
//!     → startup builds the bucket registry, queue routes and gateway routes from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AuditConfig, BackendConfig, BridgeConfig, BrokerConfig, BucketConfig, GatewayConfig,
    ObservabilityConfig, QueueConfig, RpcConfig,
};
pub use validation::{validate_config, ValidationError};
