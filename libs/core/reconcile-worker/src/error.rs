//! Reconcile error types and error categorization
//!
//! The category decides what the controller does with a failed key:
//! - **Transient**: requeue with exponential backoff
//! - **Permanent**: log and drop until something enqueues the key again

use std::time::Duration;
use thiserror::Error;

/// Category of error for determining requeue behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }

    /// Exponential backoff `base * 2^failures`, capped at `max`.
    ///
    /// Permanent errors are never requeued and get no delay.
    pub fn backoff_delay(&self, failures: u32, base: Duration, max: Duration) -> Duration {
        if *self == ErrorCategory::Permanent {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(failures.min(31));
        base.saturating_mul(factor).min(max)
    }
}

/// Errors a [`crate::Reconciler`] may return.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Dependency unavailable, try again later
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying will not help
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The reconcile call exceeded the controller's deadline
    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),

    /// The reconcile task panicked; retried with backoff like a transient error
    #[error("reconcile panicked: {0}")]
    Panicked(String),

    /// Bug or invariant violation inside the reconciler
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    pub fn transient(message: impl Into<String>) -> Self {
        ReconcileError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ReconcileError::Permanent(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ReconcileError::Transient(_)
            | ReconcileError::Timeout(_)
            | ReconcileError::Panicked(_) => ErrorCategory::Transient,
            ReconcileError::Permanent(_) | ReconcileError::Internal(_) => {
                ErrorCategory::Permanent
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);

        // 1s, 2s, 4s ... capped at 5 minutes
        assert_eq!(ErrorCategory::Transient.backoff_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(ErrorCategory::Transient.backoff_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(ErrorCategory::Transient.backoff_delay(3, base, max), Duration::from_secs(8));
        assert_eq!(ErrorCategory::Transient.backoff_delay(9, base, max), max);
        assert_eq!(ErrorCategory::Transient.backoff_delay(u32::MAX, base, max), max);

        assert_eq!(ErrorCategory::Permanent.backoff_delay(0, base, max), Duration::ZERO);
    }

    #[test]
    fn test_error_categories() {
        assert!(ReconcileError::transient("store down").is_transient());
        assert!(ReconcileError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ReconcileError::Panicked("index out of bounds".into()).is_transient());
        assert!(!ReconcileError::permanent("bad key").is_transient());
        assert_eq!(
            ReconcileError::Internal("oops".into()).category(),
            ErrorCategory::Permanent
        );
    }
}
