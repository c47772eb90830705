//! In-process store for tests and single-process development.

use super::{check_version, guard_terminal, ResourceStore, StoreError, StoreResult};
use crate::models::{
    ChangeType, ObjectKey, ResourceEvent, ResourceKind, Secret, SendRequest, SendRequestSpec,
    SendRequestStatus, SenderConfig, SenderConfigSpec, SenderConfigStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    send_requests: BTreeMap<ObjectKey, SendRequest>,
    sender_configs: BTreeMap<ObjectKey, SenderConfig>,
    secrets: BTreeMap<ObjectKey, Secret>,
    next_version: u64,
}

impl Tables {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    denied_secrets: HashSet<ObjectKey>,
    status_conflicts: usize,
}

/// `ResourceStore` backed by in-memory maps.
///
/// With the `testing` feature it also carries a few fault switches, so tests
/// can exercise outage, access and race handling without a real backend.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    faults: RwLock<Faults>,
    events: broadcast::Sender<ResourceEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            faults: RwLock::new(Faults::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> RwLockWriteGuard<'_, Faults> {
        self.faults.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> StoreResult<()> {
        if self.faults().unavailable {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    fn emit(&self, kind: ResourceKind, change: ChangeType, key: ObjectKey) {
        // No subscribers is fine
        let _ = self.events.send(ResourceEvent::new(kind, change, key));
    }

    /// Make every operation fail with a backend error until switched back.
    #[cfg(any(test, feature = "testing"))]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    /// Make reads of this secret fail with `AccessDenied`.
    #[cfg(any(test, feature = "testing"))]
    pub fn deny_secret(&self, key: &ObjectKey) {
        self.faults().denied_secrets.insert(key.clone());
    }

    /// The next `count` send-request status writes lose a race with another writer.
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_status_conflicts(&self, count: usize) {
        self.faults().status_conflicts = count;
    }

    /// Overwrite a status without version or terminal checks, as another
    /// process would have done. Bumps the resource version.
    #[cfg(any(test, feature = "testing"))]
    pub fn force_send_request_status(&self, key: &ObjectKey, status: SendRequestStatus) {
        let mut tables = self.write();
        let version = tables.bump();
        if let Some(request) = tables.send_requests.get_mut(key) {
            request.status = status;
            request.metadata.resource_version = version;
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_send_request(&self, key: &ObjectKey) -> StoreResult<Option<SendRequest>> {
        self.available()?;
        Ok(self.read().send_requests.get(key).cloned())
    }

    async fn list_send_requests(&self) -> StoreResult<Vec<SendRequest>> {
        self.available()?;
        Ok(self.read().send_requests.values().cloned().collect())
    }

    async fn create_send_request(&self, mut request: SendRequest) -> StoreResult<SendRequest> {
        self.available()?;
        let key = request.key();
        {
            let mut tables = self.write();
            if tables.send_requests.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }
            request.metadata.generation = 1;
            request.metadata.resource_version = tables.bump();
            request.metadata.created_at = Utc::now();
            request.status = SendRequestStatus::default();
            tables.send_requests.insert(key.clone(), request.clone());
        }
        self.emit(ResourceKind::SendRequest, ChangeType::Created, key);
        Ok(request)
    }

    async fn update_send_request_spec(
        &self,
        key: &ObjectKey,
        spec: SendRequestSpec,
    ) -> StoreResult<SendRequest> {
        self.available()?;
        let updated = {
            let mut tables = self.write();
            let version = tables.bump();
            let request = tables
                .send_requests
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if request.spec != spec {
                request.spec = spec;
                request.metadata.generation += 1;
            }
            request.metadata.resource_version = version;
            request.clone()
        };
        self.emit(ResourceKind::SendRequest, ChangeType::Updated, key.clone());
        Ok(updated)
    }

    async fn update_send_request_status(
        &self,
        key: &ObjectKey,
        expected_version: u64,
        status: SendRequestStatus,
    ) -> StoreResult<SendRequest> {
        self.available()?;
        {
            let mut faults = self.faults();
            if faults.status_conflicts > 0 {
                faults.status_conflicts -= 1;
                return Err(StoreError::Conflict {
                    key: key.clone(),
                    expected: expected_version,
                    actual: expected_version + 1,
                });
            }
        }

        let updated = {
            let mut tables = self.write();
            let current = tables
                .send_requests
                .get(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            check_version(key, expected_version, current.metadata.resource_version)?;
            guard_terminal(key, &current.status, &status)?;

            let version = tables.bump();
            let request = tables
                .send_requests
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            request.status = status;
            request.metadata.resource_version = version;
            request.clone()
        };
        self.emit(ResourceKind::SendRequest, ChangeType::Status, key.clone());
        Ok(updated)
    }

    async fn delete_send_request(&self, key: &ObjectKey) -> StoreResult<bool> {
        self.available()?;
        let removed = self.write().send_requests.remove(key).is_some();
        if removed {
            self.emit(ResourceKind::SendRequest, ChangeType::Deleted, key.clone());
        }
        Ok(removed)
    }

    async fn get_sender_config(&self, key: &ObjectKey) -> StoreResult<Option<SenderConfig>> {
        self.available()?;
        Ok(self.read().sender_configs.get(key).cloned())
    }

    async fn list_sender_configs(&self) -> StoreResult<Vec<SenderConfig>> {
        self.available()?;
        Ok(self.read().sender_configs.values().cloned().collect())
    }

    async fn apply_sender_config(
        &self,
        key: &ObjectKey,
        spec: SenderConfigSpec,
    ) -> StoreResult<SenderConfig> {
        self.available()?;
        let (config, change) = {
            let mut tables = self.write();
            let version = tables.bump();
            match tables.sender_configs.get_mut(key) {
                Some(existing) => {
                    if existing.spec != spec {
                        existing.spec = spec;
                        existing.metadata.generation += 1;
                    }
                    existing.metadata.resource_version = version;
                    (existing.clone(), ChangeType::Updated)
                }
                None => {
                    let mut config =
                        SenderConfig::new(key.namespace.clone(), key.name.clone(), spec);
                    config.metadata.resource_version = version;
                    tables.sender_configs.insert(key.clone(), config.clone());
                    (config, ChangeType::Created)
                }
            }
        };
        self.emit(ResourceKind::SenderConfig, change, key.clone());
        Ok(config)
    }

    async fn update_sender_config_status(
        &self,
        key: &ObjectKey,
        expected_version: u64,
        status: SenderConfigStatus,
    ) -> StoreResult<SenderConfig> {
        self.available()?;
        let updated = {
            let mut tables = self.write();
            let actual = tables
                .sender_configs
                .get(key)
                .map(|c| c.metadata.resource_version)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            check_version(key, expected_version, actual)?;

            let version = tables.bump();
            let config = tables
                .sender_configs
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            config.status = status;
            config.metadata.resource_version = version;
            config.clone()
        };
        self.emit(ResourceKind::SenderConfig, ChangeType::Status, key.clone());
        Ok(updated)
    }

    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Option<Secret>> {
        self.available()?;
        if self.faults().denied_secrets.contains(key) {
            return Err(StoreError::AccessDenied {
                key: key.clone(),
                reason: "reader lacks permission".to_string(),
            });
        }
        Ok(self.read().secrets.get(key).cloned())
    }

    async fn apply_secret(&self, mut secret: Secret) -> StoreResult<Secret> {
        self.available()?;
        let key = secret.key();
        let change = {
            let mut tables = self.write();
            secret.metadata.resource_version = tables.bump();
            let change = if tables.secrets.contains_key(&key) {
                ChangeType::Updated
            } else {
                ChangeType::Created
            };
            tables.secrets.insert(key.clone(), secret.clone());
            change
        };
        self.emit(ResourceKind::Secret, change, key);
        Ok(secret)
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryState;

    fn request(name: &str) -> SendRequest {
        SendRequest::new(
            "acme",
            name,
            crate::models::SendRequestSpec::new("transactional", "ada@example.com", "Hi", "Hello"),
        )
    }

    #[tokio::test]
    async fn test_create_assigns_generation_and_version() {
        let store = InMemoryStore::new();
        let created = store.create_send_request(request("a")).await.unwrap();

        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.resource_version > 0);
        assert_eq!(created.status.delivery_state, DeliveryState::Pending);

        let err = store.create_send_request(request("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_spec_update_bumps_generation_only_on_change() {
        let store = InMemoryStore::new();
        let created = store.create_send_request(request("a")).await.unwrap();
        let key = created.key();

        let same = store
            .update_send_request_spec(&key, created.spec.clone())
            .await
            .unwrap();
        assert_eq!(same.metadata.generation, 1);

        let mut spec = created.spec.clone();
        spec.subject = "Updated".to_string();
        let changed = store.update_send_request_spec(&key, spec).await.unwrap();
        assert_eq!(changed.metadata.generation, 2);
        assert!(changed.metadata.resource_version > same.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_status_write_requires_current_version() {
        let store = InMemoryStore::new();
        let created = store.create_send_request(request("a")).await.unwrap();
        let key = created.key();

        let status = SendRequestStatus {
            delivery_state: DeliveryState::RetryScheduled,
            attempt_count: 1,
            ..Default::default()
        };
        let updated = store
            .update_send_request_status(&key, created.metadata.resource_version, status.clone())
            .await
            .unwrap();
        assert_eq!(updated.status, status);

        let err = store
            .update_send_request_status(&key, created.metadata.resource_version, status)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_status_write_cannot_leave_sent() {
        let store = InMemoryStore::new();
        let created = store.create_send_request(request("a")).await.unwrap();
        let key = created.key();

        let sent = store
            .update_send_request_status(
                &key,
                created.metadata.resource_version,
                SendRequestStatus {
                    delivery_state: DeliveryState::Sent,
                    message_id: Some("m-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .update_send_request_status(
                &key,
                sent.metadata.resource_version,
                SendRequestStatus {
                    delivery_state: DeliveryState::Failed,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalState(_)));

        let stored = store.get_send_request(&key).await.unwrap().unwrap();
        assert_eq!(stored.status.delivery_state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let store = InMemoryStore::new();
        let mut events = store.subscribe();

        let created = store.create_send_request(request("a")).await.unwrap();
        store
            .apply_sender_config(
                &ObjectKey::new("acme", "transactional"),
                SenderConfigSpec::new("native-smtp", "smtp-creds", "noreply@acme.test"),
            )
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, ResourceKind::SendRequest);
        assert_eq!(first.change, ChangeType::Created);
        assert_eq!(first.key, created.key());

        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, ResourceKind::SenderConfig);
    }

    #[tokio::test]
    async fn test_faults() {
        let store = InMemoryStore::new();
        let secret_key = ObjectKey::new("acme", "creds");
        store
            .apply_secret(Secret::new("acme", "creds").with_entry("password", "x"))
            .await
            .unwrap();

        store.deny_secret(&secret_key);
        assert!(matches!(
            store.get_secret(&secret_key).await,
            Err(StoreError::AccessDenied { .. })
        ));

        store.set_unavailable(true);
        assert!(matches!(store.ping().await, Err(StoreError::Backend(_))));
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_sender_config_bumps_generation_on_change() {
        let store = InMemoryStore::new();
        let key = ObjectKey::new("acme", "transactional");
        let spec = SenderConfigSpec::new("native-smtp", "smtp-creds", "noreply@acme.test");

        let first = store.apply_sender_config(&key, spec.clone()).await.unwrap();
        assert_eq!(first.metadata.generation, 1);

        let unchanged = store.apply_sender_config(&key, spec.clone()).await.unwrap();
        assert_eq!(unchanged.metadata.generation, 1);

        let changed = store
            .apply_sender_config(&key, spec.with_port(2525))
            .await
            .unwrap();
        assert_eq!(changed.metadata.generation, 2);
    }
}
