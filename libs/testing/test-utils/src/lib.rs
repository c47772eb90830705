//! Shared test utilities
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestNamespace`: deterministic, collision-free namespaces per test
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestNamespace, TestRedis};
//!
//! #[tokio::test]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let ns = TestNamespace::from_test_name("my_redis_test");
//!     let store = RedisStore::connect(&RedisConfig::new(redis.connection_string())).await.unwrap();
//!     /* ... */
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Deterministic names derived from the test name, so reruns hit the same
/// keys and parallel tests never share one.
pub struct TestNamespace {
    seed: u64,
}

impl TestNamespace {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn from_test_name(name: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Namespace for resources created by this test.
    pub fn namespace(&self) -> String {
        format!("test-{:x}", self.seed)
    }

    /// Resource name within the namespace, e.g. `welcome-3f2a...`.
    pub fn name(&self, prefix: &str) -> String {
        format!("{}-{:x}", prefix, self.seed & 0xffff_ffff)
    }

    /// Key prefix isolating this test's data in a shared Redis.
    pub fn key_prefix(&self) -> String {
        format!("courier-test-{:x}", self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_is_deterministic() {
        let a = TestNamespace::from_test_name("test_create");
        let b = TestNamespace::from_test_name("test_create");
        let c = TestNamespace::from_test_name("test_delete");

        assert_eq!(a.namespace(), b.namespace());
        assert_ne!(a.namespace(), c.namespace());
        assert!(a.name("welcome").starts_with("welcome-"));
        assert!(a.key_prefix().starts_with("courier-test-"));
    }
}
