//! Controller configuration

use std::time::Duration;

/// Configuration for a [`crate::Controller`]
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Controller name, used for logs and metric labels
    pub name: String,

    /// Number of workers pulling keys from the queue
    pub max_concurrent_reconciles: usize,

    /// Upper bound on a single reconcile call
    pub reconcile_timeout: Duration,

    /// First delay after a transient error
    pub error_backoff_base: Duration,

    /// Cap on the error backoff
    pub error_backoff_max: Duration,
}

impl ControllerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_concurrent_reconciles: 4,
            reconcile_timeout: Duration::from_secs(120),
            error_backoff_base: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(300),
        }
    }

    pub fn with_max_concurrent_reconciles(mut self, count: usize) -> Self {
        self.max_concurrent_reconciles = count.max(1);
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.error_backoff_base = base;
        self.error_backoff_max = max.max(base);
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new("controller")
    }
}
