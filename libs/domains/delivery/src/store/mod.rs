//! Durable resource store.
//!
//! The store owns `generation` and `resourceVersion`. Spec writes bump both,
//! status writes bump only the version and must name the version they were
//! computed from.

mod memory;
mod redis;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

use crate::models::{
    DeliveryState, ObjectKey, ResourceEvent, Secret, SendRequest, SendRequestSpec,
    SendRequestStatus, SenderConfig, SenderConfigSpec, SenderConfigStatus,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("access to {key} denied: {reason}")]
    AccessDenied { key: ObjectKey, reason: String },

    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    /// A status write tried to move a `Sent` request somewhere else.
    #[error("{0} is already Sent; status is immutable")]
    TerminalState(ObjectKey),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Worth retrying the same operation later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Resource persistence plus change notification.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_send_request(&self, key: &ObjectKey) -> StoreResult<Option<SendRequest>>;

    async fn list_send_requests(&self) -> StoreResult<Vec<SendRequest>>;

    /// Persist a new request. Generation starts at 1 and status at its default.
    async fn create_send_request(&self, request: SendRequest) -> StoreResult<SendRequest>;

    /// Replace the spec and bump the generation.
    async fn update_send_request_spec(
        &self,
        key: &ObjectKey,
        spec: SendRequestSpec,
    ) -> StoreResult<SendRequest>;

    /// Replace the status if the stored version still equals `expected_version`.
    async fn update_send_request_status(
        &self,
        key: &ObjectKey,
        expected_version: u64,
        status: SendRequestStatus,
    ) -> StoreResult<SendRequest>;

    async fn delete_send_request(&self, key: &ObjectKey) -> StoreResult<bool>;

    async fn get_sender_config(&self, key: &ObjectKey) -> StoreResult<Option<SenderConfig>>;

    async fn list_sender_configs(&self) -> StoreResult<Vec<SenderConfig>>;

    /// Create the config or replace its spec. The generation only moves when
    /// the spec actually changed.
    async fn apply_sender_config(
        &self,
        key: &ObjectKey,
        spec: SenderConfigSpec,
    ) -> StoreResult<SenderConfig>;

    async fn update_sender_config_status(
        &self,
        key: &ObjectKey,
        expected_version: u64,
        status: SenderConfigStatus,
    ) -> StoreResult<SenderConfig>;

    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Option<Secret>>;

    async fn apply_secret(&self, secret: Secret) -> StoreResult<Secret>;

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Refuse any status write that would change a `Sent` status.
pub(crate) fn guard_terminal(
    key: &ObjectKey,
    current: &SendRequestStatus,
    next: &SendRequestStatus,
) -> StoreResult<()> {
    if current.delivery_state == DeliveryState::Sent && current != next {
        return Err(StoreError::TerminalState(key.clone()));
    }
    Ok(())
}

pub(crate) fn check_version(key: &ObjectKey, expected: u64, actual: u64) -> StoreResult<()> {
    if expected != actual {
        return Err(StoreError::Conflict {
            key: key.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_allows_leaving_non_terminal_states() {
        let key = ObjectKey::new("acme", "a");
        let current = SendRequestStatus {
            delivery_state: DeliveryState::Failed,
            ..Default::default()
        };
        let next = SendRequestStatus {
            delivery_state: DeliveryState::Sent,
            ..Default::default()
        };
        assert!(guard_terminal(&key, &current, &next).is_ok());
    }

    #[test]
    fn test_guard_rejects_regression_from_sent() {
        let key = ObjectKey::new("acme", "a");
        let sent = SendRequestStatus {
            delivery_state: DeliveryState::Sent,
            message_id: Some("m-1".into()),
            ..Default::default()
        };
        let retry = SendRequestStatus {
            delivery_state: DeliveryState::RetryScheduled,
            ..Default::default()
        };

        assert!(matches!(
            guard_terminal(&key, &sent, &retry),
            Err(StoreError::TerminalState(_))
        ));
        // Rewriting the identical status is harmless
        assert!(guard_terminal(&key, &sent, &sent.clone()).is_ok());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Backend("timeout".into()).is_transient());
        assert!(!StoreError::NotFound(ObjectKey::new("a", "b")).is_transient());
    }
}
