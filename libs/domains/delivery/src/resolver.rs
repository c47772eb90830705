//! Credential & config resolution.
//!
//! Missing and forbidden references are one permanent class
//! ([`ResolveError::is_unresolvable`]). Store outages and slow reads are not
//! configuration mistakes and stay transient.

use crate::models::{ObjectKey, Secret, SenderConfig};
use crate::store::{ResourceStore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Config not found: {0}")]
    ConfigNotFound(ObjectKey),

    #[error("Secret not found: {0}")]
    SecretNotFound(ObjectKey),

    #[error("Access denied reading {key}: {reason}")]
    AccessDenied { key: ObjectKey, reason: String },

    #[error("Store unavailable while reading {key}: {source}")]
    Store {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },

    #[error("Timed out after {after:?} reading {key}")]
    Timeout { key: ObjectKey, after: Duration },
}

impl ResolveError {
    /// The reference itself is bad; retrying will not help.
    pub fn is_unresolvable(&self) -> bool {
        matches!(
            self,
            ResolveError::ConfigNotFound(_)
                | ResolveError::SecretNotFound(_)
                | ResolveError::AccessDenied { .. }
        )
    }
}

/// A sender config together with the secret it points to.
#[derive(Debug, Clone)]
pub struct ResolvedSender {
    pub config: SenderConfig,
    pub secret: Secret,
}

/// Read-only lookup of sender configs and secrets.
pub struct ConfigResolver<S> {
    store: Arc<S>,
    read_timeout: Duration,
}

impl<S> Clone for ConfigResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            read_timeout: self.read_timeout,
        }
    }
}

impl<S: ResourceStore> ConfigResolver<S> {
    pub fn new(store: Arc<S>, read_timeout: Duration) -> Self {
        Self {
            store,
            read_timeout,
        }
    }

    async fn bounded<T, F>(&self, key: &ObjectKey, read: F) -> Result<Option<T>, ResolveError>
    where
        F: Future<Output = Result<Option<T>, StoreError>>,
    {
        match tokio::time::timeout(self.read_timeout, read).await {
            Err(_) => Err(ResolveError::Timeout {
                key: key.clone(),
                after: self.read_timeout,
            }),
            Ok(Err(StoreError::AccessDenied { reason, .. })) => Err(ResolveError::AccessDenied {
                key: key.clone(),
                reason,
            }),
            Ok(Err(StoreError::NotFound(_))) => Ok(None),
            Ok(Err(source)) => Err(ResolveError::Store {
                key: key.clone(),
                source,
            }),
            Ok(Ok(found)) => Ok(found),
        }
    }

    pub async fn resolve_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SenderConfig, ResolveError> {
        let key = ObjectKey::new(namespace, name);
        self.bounded(&key, self.store.get_sender_config(&key))
            .await?
            .ok_or(ResolveError::ConfigNotFound(key))
    }

    pub async fn resolve_secret(&self, namespace: &str, name: &str) -> Result<Secret, ResolveError> {
        let key = ObjectKey::new(namespace, name);
        self.bounded(&key, self.store.get_secret(&key))
            .await?
            .ok_or(ResolveError::SecretNotFound(key))
    }

    /// Config first, then the secret it references.
    pub async fn resolve(
        &self,
        namespace: &str,
        config_ref: &str,
    ) -> Result<ResolvedSender, ResolveError> {
        let config = self.resolve_config(namespace, config_ref).await?;
        let secret = self
            .resolve_secret(namespace, &config.spec.api_token_secret_ref)
            .await?;

        debug!(
            namespace = %namespace,
            config = %config_ref,
            provider = %config.spec.provider,
            "Resolved sender config"
        );
        Ok(ResolvedSender { config, secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderConfigSpec;
    use crate::store::InMemoryStore;

    async fn seeded() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .apply_sender_config(
                &ObjectKey::new("acme", "transactional"),
                SenderConfigSpec::new("native-smtp", "smtp-creds", "noreply@acme.test")
                    .with_domain("smtp.acme.test"),
            )
            .await
            .unwrap();
        store
            .apply_secret(
                Secret::new("acme", "smtp-creds")
                    .with_entry("username", "mailer")
                    .with_entry("password", "s3cret"),
            )
            .await
            .unwrap();
        store
    }

    fn resolver(store: Arc<InMemoryStore>) -> ConfigResolver<InMemoryStore> {
        ConfigResolver::new(store, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_resolves_config_and_secret() {
        let resolved = resolver(seeded().await)
            .resolve("acme", "transactional")
            .await
            .unwrap();

        assert_eq!(resolved.config.spec.provider, "native-smtp");
        assert_eq!(resolved.secret.get("username"), Some("mailer"));
    }

    #[tokio::test]
    async fn test_missing_config_is_unresolvable() {
        let err = resolver(seeded().await)
            .resolve("acme", "marketing")
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::ConfigNotFound(_)));
        assert!(err.is_unresolvable());
        assert!(err.to_string().starts_with("Config not found"));
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let err = resolver(seeded().await)
            .resolve("other-tenant", "transactional")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_secret_is_unresolvable() {
        let store = seeded().await;
        store
            .apply_sender_config(
                &ObjectKey::new("acme", "transactional"),
                SenderConfigSpec::new("native-smtp", "rotated-away", "noreply@acme.test"),
            )
            .await
            .unwrap();

        let err = resolver(store).resolve("acme", "transactional").await.unwrap_err();
        assert!(matches!(err, ResolveError::SecretNotFound(_)));
        assert!(err.is_unresolvable());
    }

    #[tokio::test]
    async fn test_access_denied_is_unresolvable() {
        let store = seeded().await;
        store.deny_secret(&ObjectKey::new("acme", "smtp-creds"));

        let err = resolver(store).resolve("acme", "transactional").await.unwrap_err();
        assert!(matches!(err, ResolveError::AccessDenied { .. }));
        assert!(err.is_unresolvable());
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let store = seeded().await;
        store.set_unavailable(true);

        let err = resolver(store).resolve("acme", "transactional").await.unwrap_err();
        assert!(matches!(err, ResolveError::Store { .. }));
        assert!(!err.is_unresolvable());
    }
}
