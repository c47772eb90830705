//! Resend transactional email API.

use super::{Transport, TransportError, TransportRequest, TransportResult};
use crate::config::DEFAULT_RESEND_API_BASE;
use crate::factory::{FactoryError, ProviderSettings};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub struct ResendProvider {
    client: Client,
    api_token: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    from: String,
    to: Vec<&'a str>,
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Error envelope returned on non-2xx.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl ResendProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, FactoryError> {
        let api_token = settings
            .api_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FactoryError::InvalidParameters("API token is required".into()))?;

        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| FactoryError::InvalidParameters(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_token: api_token.to_string(),
            base_url: DEFAULT_RESEND_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn error_from_response(response: reqwest::Response) -> TransportError {
        let status = response.status();
        let raw = response.text().await.unwrap_or_default();

        let message = match serde_json::from_str::<ErrorEnvelope>(&raw) {
            Ok(ErrorEnvelope {
                message: Some(message),
                name,
                status_code,
            }) => {
                let code = status_code.unwrap_or(status.as_u16());
                match name {
                    Some(name) => format!("Resend {code} {name}: {message}"),
                    None => format!("Resend {code}: {message}"),
                }
            }
            _ if raw.trim().is_empty() => format!("Resend returned {status}"),
            _ => format!("Resend returned {status}: {}", raw.trim()),
        };

        classify_status(status, message)
    }
}

/// 429 and 5xx are retryable, every other non-2xx is not.
fn classify_status(status: StatusCode, message: String) -> TransportError {
    let err = if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        TransportError::transient(message)
    } else {
        TransportError::permanent(message)
    };
    err.with_status(status.as_u16())
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::transient(format!("Resend request timed out: {err}"))
    } else if err.is_builder() {
        TransportError::permanent(format!("Invalid Resend request: {err}"))
    } else {
        TransportError::transient(format!("Resend request failed: {err}"))
    }
}

#[async_trait]
impl Transport for ResendProvider {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResult, TransportError> {
        let from = match &request.from_name {
            Some(name) => format!("{} <{}>", name, request.from),
            None => request.from.clone(),
        };
        let payload = EmailPayload {
            from,
            to: vec![request.to.as_str()],
            subject: &request.subject,
            html: request.html_body.as_deref().unwrap_or(&request.text_body),
            text: request
                .html_body
                .as_ref()
                .map(|_| request.text_body.as_str())
                .filter(|t| !t.is_empty()),
            cc: request.cc.clone(),
            bcc: request.bcc.clone(),
            reply_to: request.reply_to.as_deref(),
            headers: request.headers.clone(),
        };

        debug!(to = %request.to, idempotency_key = %request.message_id, "Sending email via Resend");

        let response = self
            .client
            .post(self.url("/emails"))
            .bearer_auth(&self.api_token)
            .header("Idempotency-Key", &request.message_id)
            .json(&payload)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let err = Self::error_from_response(response).await;
            warn!(to = %request.to, error = %err.message, kind = %err.kind, "Resend rejected email");
            return Err(err);
        }

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| TransportError::transient(format!("Unreadable Resend response: {e}")))?;

        info!(to = %request.to, message_id = %body.id, "Email accepted by Resend");
        Ok(TransportResult::accepted(body.id))
    }

    async fn verify_credentials(&self) -> Result<(), TransportError> {
        let response = self
            .client
            .get(self.url("/domains"))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(request_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}
