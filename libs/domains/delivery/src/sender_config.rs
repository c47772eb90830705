//! SenderConfig validation.
//!
//! Runs once per spec generation. Checks that the referenced secret exists and
//! that a transport can be built from it, optionally proving the credentials
//! with one authenticated call.

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::factory::{ProviderSettings, TransportFactory};
use crate::models::{ObjectKey, SenderConfig, SenderConfigStatus, SenderPhase};
use crate::providers::{Transport, TransportError};
use crate::resolver::{ConfigResolver, ResolvedSender};
use crate::store::{ResourceStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use reconcile_worker::{Action, ReconcileError, Reconciler};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const MAX_STATUS_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderConfigOutcome {
    Missing,
    /// Current generation already validated.
    UpToDate,
    Validated {
        phase: SenderPhase,
        provider_verified: bool,
    },
}

struct Validation {
    phase: SenderPhase,
    message: String,
    error: Option<String>,
    provider_verified: bool,
}

impl Validation {
    fn invalid(error: impl ToString) -> Self {
        let error = error.to_string();
        Self {
            phase: SenderPhase::Invalid,
            message: "Sender configuration is invalid".to_string(),
            error: Some(error),
            provider_verified: false,
        }
    }
}

pub struct SenderConfigReconciler<S, F> {
    store: Arc<S>,
    resolver: ConfigResolver<S>,
    factory: F,
    config: DeliveryConfig,
}

impl<S, F> SenderConfigReconciler<S, F>
where
    S: ResourceStore,
    F: TransportFactory,
{
    pub fn new(store: Arc<S>, factory: F, config: DeliveryConfig) -> Self {
        let resolver = ConfigResolver::new(Arc::clone(&store), config.store_timeout);
        Self {
            store,
            resolver,
            factory,
            config,
        }
    }

    async fn load(&self, key: &ObjectKey) -> DeliveryResult<Option<SenderConfig>> {
        tokio::time::timeout(self.config.store_timeout, self.store.get_sender_config(key))
            .await
            .map_err(|_| DeliveryError::StoreTimeout {
                key: key.clone(),
                after: self.config.store_timeout,
            })?
            .map_err(DeliveryError::from)
    }

    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile_key(&self, key: &ObjectKey) -> DeliveryResult<SenderConfigOutcome> {
        let Some(mut current) = self.load(key).await? else {
            return Ok(SenderConfigOutcome::Missing);
        };
        if current.status.observed_generation == current.metadata.generation {
            return Ok(SenderConfigOutcome::UpToDate);
        }

        let validation = self.validate(&current).await?;

        for _ in 0..MAX_STATUS_WRITE_ATTEMPTS {
            let status = SenderConfigStatus {
                phase: validation.phase,
                message: Some(validation.message.clone()),
                last_validated: Some(Utc::now()),
                last_error: validation.error.clone(),
                provider_verified: validation.provider_verified,
                observed_generation: current.metadata.generation,
            };

            match self
                .store
                .update_sender_config_status(key, current.metadata.resource_version, status)
                .await
            {
                Ok(_) => {
                    counter!(
                        "sender_config_validations_total",
                        "phase" => validation.phase.to_string()
                    )
                    .increment(1);
                    match validation.phase {
                        SenderPhase::Active => info!(
                            provider = %current.spec.provider,
                            verified = validation.provider_verified,
                            "Sender config active"
                        ),
                        _ => warn!(
                            provider = %current.spec.provider,
                            error = validation.error.as_deref().unwrap_or_default(),
                            "Sender config invalid"
                        ),
                    }
                    return Ok(SenderConfigOutcome::Validated {
                        phase: validation.phase,
                        provider_verified: validation.provider_verified,
                    });
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!("Sender config status write conflicted, re-reading");
                    match self.load(key).await? {
                        None => return Ok(SenderConfigOutcome::Missing),
                        // A spec edit landed meanwhile; its own event revalidates it
                        Some(fresh) if fresh.metadata.generation != current.metadata.generation => {
                            return Ok(SenderConfigOutcome::UpToDate);
                        }
                        Some(fresh) => current = fresh,
                    }
                }
                Err(StoreError::NotFound(_)) => return Ok(SenderConfigOutcome::Missing),
                Err(e) => return Err(e.into()),
            }
        }

        Err(DeliveryError::ConflictRetriesExhausted {
            key: key.clone(),
            attempts: MAX_STATUS_WRITE_ATTEMPTS,
        })
    }

    async fn validate(&self, config: &SenderConfig) -> DeliveryResult<Validation> {
        let secret = match self
            .resolver
            .resolve_secret(&config.metadata.namespace, &config.spec.api_token_secret_ref)
            .await
        {
            Ok(secret) => secret,
            Err(e) if e.is_unresolvable() => return Ok(Validation::invalid(e)),
            Err(e) => return Err(e.into()),
        };

        let resolved = ResolvedSender {
            config: config.clone(),
            secret,
        };
        let settings = match ProviderSettings::from_resolved(&resolved, &self.config) {
            Ok(settings) => settings,
            Err(e) => return Ok(Validation::invalid(e)),
        };
        let transport = match self.factory.build(&settings) {
            Ok(transport) => transport,
            Err(e) => return Ok(Validation::invalid(e)),
        };

        if !self.config.verify_sender_credentials {
            return Ok(Validation {
                phase: SenderPhase::Active,
                message: format!("Sender configuration valid for {}", settings.kind),
                error: None,
                provider_verified: false,
            });
        }

        let verified = tokio::time::timeout(settings.timeout, transport.verify_credentials())
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout(settings.timeout)));

        Ok(match verified {
            Ok(()) => Validation {
                phase: SenderPhase::Active,
                message: format!("Credentials verified with {}", transport.name()),
                error: None,
                provider_verified: true,
            },
            Err(e) => Validation::invalid(format!("Credential verification failed: {e}")),
        })
    }
}

#[async_trait]
impl<S, F> Reconciler<ObjectKey> for SenderConfigReconciler<S, F>
where
    S: ResourceStore + 'static,
    F: TransportFactory + 'static,
{
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_key(key).await?;
        Ok(Action::Done)
    }

    fn name(&self) -> &'static str {
        "sender-config"
    }
}
