//! Delivery reconciler: drives one SendRequest toward `Sent` or `Failed`.
//!
//! Each pass makes at most one transport attempt and at most one logical
//! status write. Retries are requeues, never sleeps.

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::factory::{ProviderSettings, TransportFactory};
use crate::models::{DeliveryState, FailureReason, ObjectKey, SendRequest, SendRequestStatus};
use crate::providers::{FailureKind, Transport, TransportError, TransportRequest};
use crate::resolver::ConfigResolver;
use crate::store::{ResourceStore, StoreError};
use crate::usage::UsageRecorder;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use reconcile_worker::{Action, ReconcileError, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Status writes retried this many times when they lose a version race.
const MAX_STATUS_WRITE_ATTEMPTS: usize = 5;

/// Floor on retry delays so a zero backoff cannot spin on the transport.
const MIN_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// What a reconcile pass decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The request no longer exists.
    Missing,
    /// Already `Sent`; nothing was done.
    AlreadySent,
    /// `Failed` for the current generation; nothing was done.
    AlreadyFailed,
    /// Not due yet; nothing was written.
    Deferred(Duration),
    Sent { message_id: String },
    Failed { reason: FailureReason },
    RetryScheduled { after: Duration },
    /// Another writer finished the request first.
    Superseded,
}

impl DeliveryOutcome {
    pub fn action(&self) -> Action {
        match self {
            DeliveryOutcome::Deferred(after) | DeliveryOutcome::RetryScheduled { after } => {
                Action::RequeueAfter(*after)
            }
            _ => Action::Done,
        }
    }
}

/// Result of the attempt phase, before it is folded into a status.
#[derive(Debug, Clone)]
enum Attempt {
    /// Nothing was sent; the configuration cannot work.
    Misconfigured(String),
    Delivered {
        message_id: String,
        provider: &'static str,
        customer_id: Option<String>,
    },
    Rejected {
        error: TransportError,
        provider: &'static str,
    },
}

pub struct DeliveryReconciler<S, F> {
    store: Arc<S>,
    resolver: ConfigResolver<S>,
    factory: F,
    usage: Arc<dyn UsageRecorder>,
    config: DeliveryConfig,
}

impl<S, F> DeliveryReconciler<S, F>
where
    S: ResourceStore,
    F: TransportFactory,
{
    pub fn new(
        store: Arc<S>,
        factory: F,
        usage: Arc<dyn UsageRecorder>,
        config: DeliveryConfig,
    ) -> Self {
        let resolver = ConfigResolver::new(Arc::clone(&store), config.store_timeout);
        Self {
            store,
            resolver,
            factory,
            usage,
            config,
        }
    }

    async fn load(&self, key: &ObjectKey) -> DeliveryResult<Option<SendRequest>> {
        tokio::time::timeout(self.config.store_timeout, self.store.get_send_request(key))
            .await
            .map_err(|_| DeliveryError::StoreTimeout {
                key: key.clone(),
                after: self.config.store_timeout,
            })?
            .map_err(DeliveryError::from)
    }

    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile_key(&self, key: &ObjectKey) -> DeliveryResult<DeliveryOutcome> {
        let Some(request) = self.load(key).await? else {
            debug!("SendRequest gone");
            return Ok(DeliveryOutcome::Missing);
        };

        let status = &request.status;
        match status.delivery_state {
            DeliveryState::Sent => return Ok(DeliveryOutcome::AlreadySent),
            DeliveryState::Failed if request.is_observed() => {
                return Ok(DeliveryOutcome::AlreadyFailed);
            }
            _ => {}
        }

        let now = Utc::now();
        if let Some(wait) = remaining(request.spec.scheduled_time, now) {
            debug!(wait_secs = wait.as_secs(), "Scheduled for later");
            return Ok(DeliveryOutcome::Deferred(wait));
        }
        if status.delivery_state == DeliveryState::RetryScheduled {
            if let Some(wait) = remaining(status.next_attempt_at, now) {
                debug!(wait_secs = wait.as_secs(), "Retry not due yet");
                return Ok(DeliveryOutcome::Deferred(wait));
            }
        }

        let attempt = self.attempt(&request).await?;
        self.commit(request, attempt).await
    }

    async fn attempt(&self, request: &SendRequest) -> DeliveryResult<Attempt> {
        let spec = &request.spec;
        let resolved = match self
            .resolver
            .resolve(&request.metadata.namespace, &spec.sender_config_ref)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) if e.is_unresolvable() => return Ok(Attempt::Misconfigured(e.to_string())),
            Err(e) => return Err(e.into()),
        };

        let settings = match ProviderSettings::from_resolved(&resolved, &self.config) {
            Ok(settings) => settings,
            Err(e) => return Ok(Attempt::Misconfigured(e.to_string())),
        };
        let transport = match self.factory.build(&settings) {
            Ok(transport) => transport,
            Err(e) => return Ok(Attempt::Misconfigured(e.to_string())),
        };

        let provider = transport.name();
        let transport_request = TransportRequest::from_send_request(request, &settings);
        debug!(
            provider,
            attempt = request.status.attempt_count + 1,
            to = %spec.recipient_email,
            "Attempting delivery"
        );

        let result = tokio::time::timeout(settings.timeout, transport.send(&transport_request))
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout(settings.timeout)));

        Ok(match result {
            Ok(sent) => Attempt::Delivered {
                message_id: sent.message_id,
                provider,
                customer_id: spec
                    .customer_id
                    .clone()
                    .or_else(|| resolved.config.spec.customer_id.clone()),
            },
            Err(error) => Attempt::Rejected { error, provider },
        })
    }

    /// Write the status for `attempt`, re-reading and recomputing on version
    /// conflicts.
    async fn commit(
        &self,
        mut current: SendRequest,
        attempt: Attempt,
    ) -> DeliveryResult<DeliveryOutcome> {
        let key = current.key();
        let acted_generation = current.metadata.generation;

        for _ in 0..MAX_STATUS_WRITE_ATTEMPTS {
            let now = Utc::now();
            let status = next_status(&current, acted_generation, &attempt, now, &self.config);

            match self
                .store
                .update_send_request_status(&key, current.metadata.resource_version, status)
                .await
            {
                Ok(written) => return Ok(self.record(&written, &attempt, now).await),
                Err(StoreError::Conflict { .. }) => {
                    debug!("Status write conflicted, re-reading");
                    match self.load(&key).await? {
                        None => return Ok(DeliveryOutcome::Missing),
                        Some(fresh) if fresh.status.delivery_state == DeliveryState::Sent => {
                            info!("Request was completed by another writer");
                            return Ok(DeliveryOutcome::Superseded);
                        }
                        Some(fresh) => current = fresh,
                    }
                }
                Err(StoreError::TerminalState(_)) => return Ok(DeliveryOutcome::Superseded),
                Err(StoreError::NotFound(_)) => return Ok(DeliveryOutcome::Missing),
                Err(e) => return Err(e.into()),
            }
        }

        Err(DeliveryError::ConflictRetriesExhausted {
            key,
            attempts: MAX_STATUS_WRITE_ATTEMPTS,
        })
    }

    /// Side effects that follow a successful status write.
    async fn record(
        &self,
        written: &SendRequest,
        attempt: &Attempt,
        now: DateTime<Utc>,
    ) -> DeliveryOutcome {
        let status = &written.status;
        let state = status.delivery_state;
        let provider = status.provider.clone().unwrap_or_default();

        counter!(
            "delivery_status_transitions_total",
            "state" => state.to_string(),
            "provider" => provider.clone()
        )
        .increment(1);

        match (state, attempt) {
            (DeliveryState::Sent, Attempt::Delivered { message_id, customer_id, .. }) => {
                info!(
                    provider = %provider,
                    message_id = %message_id,
                    attempt = status.attempt_count,
                    "Email sent"
                );
                if let Some(customer_id) = customer_id {
                    if let Err(e) = self.usage.record_sent(customer_id, now).await {
                        warn!(customer_id = %customer_id, error = %e, "Failed to record usage");
                    }
                }
                DeliveryOutcome::Sent {
                    message_id: message_id.clone(),
                }
            }
            (DeliveryState::RetryScheduled, _) => {
                let after = remaining(status.next_attempt_at, now).unwrap_or_default();
                info!(
                    provider = %provider,
                    attempt = status.attempt_count,
                    retry_in_secs = after.as_secs(),
                    error = status.error.as_deref().unwrap_or_default(),
                    "Delivery failed, retry scheduled"
                );
                DeliveryOutcome::RetryScheduled { after }
            }
            _ => {
                let reason = status
                    .failure_reason
                    .unwrap_or(FailureReason::ConfigurationError);
                warn!(
                    provider = %provider,
                    attempt = status.attempt_count,
                    reason = %reason,
                    error = status.error.as_deref().unwrap_or_default(),
                    "Delivery failed permanently"
                );
                DeliveryOutcome::Failed { reason }
            }
        }
    }
}

/// Time left until `at`, if it is in the future.
fn remaining(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    at.filter(|at| *at > now)
        .and_then(|at| (at - now).to_std().ok())
}

/// Retry delays are clamped to `[MIN_RETRY_BACKOFF, config.max_backoff]`.
fn retry_backoff(request: &SendRequest, config: &DeliveryConfig) -> Duration {
    request
        .spec
        .retry_policy
        .as_ref()
        .and_then(|p| p.backoff_seconds)
        .map(Duration::from_secs)
        .unwrap_or(config.default_backoff)
        .min(config.max_backoff)
        .max(MIN_RETRY_BACKOFF)
}

fn retries_exhausted(request: &SendRequest, attempts: u32) -> bool {
    request
        .spec
        .retry_policy
        .as_ref()
        .and_then(|p| p.max_retries)
        .is_some_and(|max| attempts > max)
}

/// Fold an attempt into the status it produces on top of `current`.
fn next_status(
    request: &SendRequest,
    generation: i64,
    attempt: &Attempt,
    now: DateTime<Utc>,
    config: &DeliveryConfig,
) -> SendRequestStatus {
    let current = &request.status;
    let mut next = current.clone();
    next.observed_generation = generation;
    next.next_attempt_at = None;

    match attempt {
        Attempt::Misconfigured(message) => {
            next.delivery_state = DeliveryState::Failed;
            next.failure_reason = Some(FailureReason::ConfigurationError);
            next.error = Some(message.clone());
        }
        Attempt::Delivered {
            message_id,
            provider,
            ..
        } => {
            next.delivery_state = DeliveryState::Sent;
            next.message_id = Some(message_id.clone());
            next.provider = Some(provider.to_string());
            next.attempt_count = current.attempt_count + 1;
            next.last_attempt_at = Some(now);
            next.sent_at = Some(now);
            next.error = None;
            next.failure_reason = None;
        }
        Attempt::Rejected { error, provider } => {
            let attempts = current.attempt_count + 1;
            next.attempt_count = attempts;
            next.last_attempt_at = Some(now);
            next.provider = Some(provider.to_string());
            next.error = Some(error.to_string());

            if retries_exhausted(request, attempts) {
                next.delivery_state = DeliveryState::Failed;
                next.failure_reason = Some(FailureReason::RetriesExhausted);
            } else {
                let backoff = retry_backoff(request, config);
                next.delivery_state = DeliveryState::RetryScheduled;
                next.failure_reason = Some(match error.kind {
                    FailureKind::Transient => FailureReason::TransientTransportError,
                    FailureKind::Permanent => FailureReason::PermanentTransportError,
                });
                next.next_attempt_at = chrono::Duration::from_std(backoff)
                    .ok()
                    .and_then(|backoff| now.checked_add_signed(backoff));
            }
        }
    }
    next
}

#[async_trait]
impl<S, F> Reconciler<ObjectKey> for DeliveryReconciler<S, F>
where
    S: ResourceStore + 'static,
    F: TransportFactory + 'static,
{
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let outcome = self.reconcile_key(key).await?;
        Ok(outcome.action())
    }

    fn name(&self) -> &'static str {
        "delivery"
    }
}
