//! Queue → bucket assignment.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{BucketConfig, QueueConfig};
use crate::limiter::token_bucket::TokenBucket;

/// Admission decision for one work item.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A token was taken from the named bucket.
    Admitted { bucket: String },
    /// The named bucket was empty.
    Rejected { bucket: String },
    /// The queue has no bucket.
    Unlimited,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("queue '{queue}' references unknown bucket '{bucket}'")]
    UnknownBucket { queue: String, bucket: String },
}

/// Maps each queue to the bucket that governs it. Queues assigned the same
/// bucket name share one budget.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: HashMap<String, Arc<TokenBucket>>,
    assignments: HashMap<String, String>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration. Every bucket starts full.
    pub fn from_config(
        buckets: &[BucketConfig],
        queues: &[QueueConfig],
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for bucket in buckets {
            registry.add_bucket(
                &bucket.name,
                TokenBucket::new(bucket.capacity, bucket.refill_rate),
            );
        }
        for queue in queues {
            if let Some(bucket) = &queue.bucket {
                registry.assign(&queue.name, bucket)?;
            }
        }
        Ok(registry)
    }

    pub fn add_bucket(&mut self, name: &str, bucket: TokenBucket) {
        self.buckets.insert(name.to_string(), Arc::new(bucket));
    }

    pub fn assign(&mut self, queue: &str, bucket: &str) -> Result<(), RegistryError> {
        if !self.buckets.contains_key(bucket) {
            return Err(RegistryError::UnknownBucket {
                queue: queue.to_string(),
                bucket: bucket.to_string(),
            });
        }
        self.assignments
            .insert(queue.to_string(), bucket.to_string());
        Ok(())
    }

    pub fn bucket(&self, name: &str) -> Option<&Arc<TokenBucket>> {
        self.buckets.get(name)
    }

    /// The bucket governing `queue`, with its name.
    pub fn bucket_for(&self, queue: &str) -> Option<(&str, &Arc<TokenBucket>)> {
        let name = self.assignments.get(queue)?;
        self.buckets.get(name).map(|b| (name.as_str(), b))
    }

    /// Take one token from the bucket governing `queue`.
    pub fn try_admit(&self, queue: &str) -> Admission {
        match self.bucket_for(queue) {
            Some((name, bucket)) => {
                let bucket_name = name.to_string();
                if bucket.try_consume(1.0) {
                    Admission::Admitted {
                        bucket: bucket_name,
                    }
                } else {
                    Admission::Rejected {
                        bucket: bucket_name,
                    }
                }
            }
            None => Admission::Unlimited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(buckets: &[BucketConfig]) -> BucketRegistry {
        let queues = vec![
            QueueConfig::new("create-order", "/salesorder", Some("orders")),
            QueueConfig::new("check-inventory", "/checkinventory", Some("lookups")),
            QueueConfig::new("check-status", "/checkorder", Some("lookups")),
            QueueConfig::new("ping", "/ping", None),
        ];
        BucketRegistry::from_config(buckets, &queues).unwrap()
    }

    #[test]
    fn test_capacity_one_rate_zero() {
        let registry = registry(&[
            BucketConfig::new("orders", 1.0, 0.0),
            BucketConfig::new("lookups", 20.0, 10.0),
        ]);
        assert!(registry.try_admit("create-order").is_admitted());
        assert_eq!(
            registry.try_admit("create-order"),
            Admission::Rejected {
                bucket: "orders".to_string()
            }
        );
    }

    #[test]
    fn test_grouped_queues_share_budget() {
        let registry = registry(&[
            BucketConfig::new("orders", 10.0, 0.0),
            BucketConfig::new("lookups", 2.0, 0.0),
        ]);
        assert!(registry.try_admit("check-inventory").is_admitted());
        assert!(registry.try_admit("check-status").is_admitted());
        assert!(!registry.try_admit("check-inventory").is_admitted());
        assert!(!registry.try_admit("check-status").is_admitted());
        // Dedicated bucket is unaffected.
        assert!(registry.try_admit("create-order").is_admitted());
    }

    #[test]
    fn test_unassigned_queue_is_unlimited() {
        let registry = registry(&[
            BucketConfig::new("orders", 1.0, 0.0),
            BucketConfig::new("lookups", 1.0, 0.0),
        ]);
        for _ in 0..100 {
            assert_eq!(registry.try_admit("ping"), Admission::Unlimited);
        }
    }

    #[test]
    fn test_unknown_bucket_rejected() {
        let queues = vec![QueueConfig::new("create-order", "/salesorder", Some("nope"))];
        let err = BucketRegistry::from_config(&[], &queues).unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownBucket {
                queue: "create-order".to_string(),
                bucket: "nope".to_string()
            }
        );
    }
}
