//! Resource types: send requests, sender configs and secrets.
//!
//! Every resource splits into `spec` (what the client wants, written by the
//! client) and `status` (what the reconciler observed, written only through the
//! store's status path).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use strum::{Display, EnumString};

/// Namespace-scoped identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Store-managed bookkeeping shared by all resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Bumped on every spec change.
    pub generation: i64,
    /// Bumped on every write; status writes must name the version they read.
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            generation: 1,
            resource_version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

// ============================================================================
// SendRequest
// ============================================================================

/// Delivery state of a send request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum DeliveryState {
    /// Not attempted yet
    #[default]
    Pending,
    /// Accepted by the provider. Terminal.
    Sent,
    /// Given up. Terminal unless the spec changes.
    Failed,
    /// Last attempt failed, another one is scheduled
    RetryScheduled,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::Failed)
    }
}

/// Coarse reason code recorded next to the human-readable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum FailureReason {
    /// Sender config, secret or provider parameters are unusable
    ConfigurationError,
    /// The provider reported a temporary failure
    TransientTransportError,
    /// The provider rejected the message outright
    PermanentTransportError,
    /// The retry policy ran out of attempts
    RetriesExhausted,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Value for the `X-Priority` header.
    pub fn x_priority(&self) -> &'static str {
        match self {
            Priority::High => "1 (Highest)",
            Priority::Normal => "3 (Normal)",
            Priority::Low => "5 (Lowest)",
        }
    }
}

/// Optional retry ceiling and fixed backoff for a send request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. `None` means no ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Delay between attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequestSpec {
    /// Name of a SenderConfig in the same namespace.
    pub sender_config_ref: String,
    pub recipient_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Not-before time for the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
}

impl SendRequestSpec {
    pub fn new(
        sender_config_ref: impl Into<String>,
        recipient_email: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_config_ref: sender_config_ref.into(),
            recipient_email: recipient_email.into(),
            recipient_name: None,
            subject: subject.into(),
            body: body.into(),
            html_body: None,
            reply_to: None,
            cc: Vec::new(),
            bcc: Vec::new(),
            tags: Vec::new(),
            custom_headers: HashMap::new(),
            priority: None,
            retry_policy: None,
            scheduled_time: None,
            customer_id: None,
        }
    }

    pub fn with_html_body(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }

    pub fn with_retry_policy(mut self, max_retries: Option<u32>, backoff_seconds: Option<u64>) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_retries,
            backoff_seconds,
        });
        self
    }

    pub fn with_scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn with_customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequestStatus {
    #[serde(default)]
    pub delivery_state: DeliveryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub observed_generation: i64,
}

/// A declared "send this email" record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub metadata: ObjectMeta,
    pub spec: SendRequestSpec,
    #[serde(default)]
    pub status: SendRequestStatus,
}

impl SendRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: SendRequestSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: SendRequestStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Whether the current spec generation has already been acted on.
    pub fn is_observed(&self) -> bool {
        self.status.observed_generation >= self.metadata.generation
    }
}

// ============================================================================
// SenderConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderConfigSpec {
    /// Provider identifier, e.g. `native-smtp` or `resend`.
    pub provider: String,
    /// Name of the Secret holding credentials.
    pub api_token_secret_ref: String,
    pub sender_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    /// SMTP host for `native-smtp`; sending domain for HTTP providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
}

impl SenderConfigSpec {
    pub fn new(
        provider: impl Into<String>,
        api_token_secret_ref: impl Into<String>,
        sender_email: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            api_token_secret_ref: api_token_secret_ref.into(),
            sender_email: sender_email.into(),
            from_name: None,
            domain: None,
            port: None,
            timeout: None,
            customer_id: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = Some(name.into());
        self
    }

    pub fn with_customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum SenderPhase {
    #[default]
    Pending,
    Active,
    Invalid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderConfigStatus {
    #[serde(default)]
    pub phase: SenderPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub provider_verified: bool,
    #[serde(default)]
    pub observed_generation: i64,
}

/// How to send: provider, sender identity and a pointer to credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    pub metadata: ObjectMeta,
    pub spec: SenderConfigSpec,
    #[serde(default)]
    pub status: SenderConfigStatus,
}

impl SenderConfig {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: SenderConfigSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: SenderConfigStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn secret_key(&self) -> ObjectKey {
        ObjectKey::new(
            self.metadata.namespace.clone(),
            self.spec.api_token_secret_ref.clone(),
        )
    }
}

// ============================================================================
// Secret
// ============================================================================

/// Opaque credential bag. `Debug` never prints values.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            data: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Non-empty value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("metadata", &self.metadata)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Change events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceKind {
    SendRequest,
    SenderConfig,
    Secret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Status,
    Deleted,
}

/// Emitted by the store after every successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub change: ChangeType,
    pub key: ObjectKey,
}

impl ResourceEvent {
    pub fn new(kind: ResourceKind, change: ChangeType, key: ObjectKey) -> Self {
        Self { kind, change, key }
    }
}
