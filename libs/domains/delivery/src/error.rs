use crate::models::ObjectKey;
use crate::resolver::ResolveError;
use crate::store::StoreError;
use reconcile_worker::ReconcileError;
use std::time::Duration;
use thiserror::Error;

/// Reasons a reconcile pass ends without deciding anything about the
/// request. Outcomes that are decided (sent, failed, retry) are not errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("store read for {key} timed out after {after:?}")]
    StoreTimeout { key: ObjectKey, after: Duration },

    #[error("status write for {key} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { key: ObjectKey, attempts: usize },
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

impl From<DeliveryError> for ReconcileError {
    fn from(err: DeliveryError) -> Self {
        match &err {
            DeliveryError::Store(StoreError::Serialization(_)) => {
                ReconcileError::permanent(err.to_string())
            }
            _ => ReconcileError::transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outages_map_to_transient() {
        let err: ReconcileError = DeliveryError::Store(StoreError::Backend("down".into())).into();
        assert!(err.is_transient());

        let err: ReconcileError = DeliveryError::ConflictRetriesExhausted {
            key: ObjectKey::new("acme", "a"),
            attempts: 5,
        }
        .into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_corrupt_record_is_permanent() {
        let err: ReconcileError =
            DeliveryError::Store(StoreError::Serialization("bad json".into())).into();
        assert!(!err.is_transient());
    }
}
