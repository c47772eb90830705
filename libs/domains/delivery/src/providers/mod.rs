//! Transport providers.
//!
//! One [`Transport`] call is one delivery attempt. Providers classify their
//! own failures; the reconciler decides what to do with them.

#[cfg(any(test, feature = "testing"))]
mod mock;
mod resend;
mod smtp;

#[cfg(any(test, feature = "testing"))]
pub use mock::{MockTransport, MockTransportFactory};
pub use resend::ResendProvider;
pub use smtp::SmtpProvider;

use crate::factory::ProviderSettings;
use crate::models::SendRequest;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use strum::Display;
use thiserror::Error;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{kind} transport error: {message}")]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
    /// SMTP reply code or HTTP status, when the peer answered.
    pub status_code: Option<u16>,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::transient(format!("timed out after {}s", after.as_secs_f64()))
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransportStatus {
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResult {
    /// Provider-assigned id.
    pub message_id: String,
    pub status: TransportStatus,
    /// Upstream response text.
    pub detail: Option<String>,
}

impl TransportResult {
    pub fn accepted(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            status: TransportStatus::Accepted,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Provider-neutral message for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    /// Stable identity hint, the SendRequest name.
    pub message_id: String,
    pub from: String,
    pub from_name: Option<String>,
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub reply_to: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub headers: BTreeMap<String, String>,
}

impl TransportRequest {
    pub fn from_send_request(request: &SendRequest, settings: &ProviderSettings) -> Self {
        let spec = &request.spec;

        let mut headers: BTreeMap<String, String> = spec
            .custom_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(priority) = spec.priority {
            headers.insert("X-Priority".to_string(), priority.x_priority().to_string());
        }

        Self {
            message_id: request.metadata.name.clone(),
            from: settings.sender_email.clone(),
            from_name: settings.from_name.clone(),
            to: spec.recipient_email.clone(),
            to_name: spec.recipient_name.clone(),
            subject: spec.subject.clone(),
            text_body: spec.body.clone(),
            html_body: spec.html_body.clone(),
            reply_to: spec.reply_to.clone(),
            cc: spec.cc.clone(),
            bcc: spec.bcc.clone(),
            headers,
        }
    }
}

/// Delivery mechanism.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One delivery attempt. Safe to repeat.
    async fn send(&self, request: &TransportRequest) -> Result<TransportResult, TransportError>;

    /// Cheapest authenticated call that sends no mail.
    async fn verify_credentials(&self) -> Result<(), TransportError>;

    fn name(&self) -> &'static str;
}

/// Built-in providers, chosen once by the factory.
pub enum Provider {
    Smtp(SmtpProvider),
    Resend(ResendProvider),
}

#[async_trait]
impl Transport for Provider {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResult, TransportError> {
        match self {
            Provider::Smtp(p) => p.send(request).await,
            Provider::Resend(p) => p.send(request).await,
        }
    }

    async fn verify_credentials(&self) -> Result<(), TransportError> {
        match self {
            Provider::Smtp(p) => p.verify_credentials().await,
            Provider::Resend(p) => p.verify_credentials().await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Provider::Smtp(p) => p.name(),
            Provider::Resend(p) => p.name(),
        }
    }
}
