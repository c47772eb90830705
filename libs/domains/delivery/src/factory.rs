//! Provider selection: identifier parsing, settings with defaults applied,
//! and construction of the concrete transport.

use crate::config::DeliveryConfig;
use crate::providers::{Provider, ResendProvider, SmtpProvider, Transport};
use crate::resolver::ResolvedSender;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FactoryError {
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Invalid provider parameters: {0}")]
    InvalidParameters(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ProviderKind {
    #[strum(to_string = "native-smtp", serialize = "smtp")]
    NativeSmtp,
    #[strum(serialize = "resend")]
    Resend,
}

impl ProviderKind {
    pub fn parse(identifier: &str) -> Result<Self, FactoryError> {
        Self::from_str(identifier.trim())
            .map_err(|_| FactoryError::UnsupportedProvider(identifier.to_string()))
    }
}

/// Everything needed to build a transport. Not persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub sender_email: String,
    pub from_name: Option<String>,
    /// SMTP host, or the sending domain for API providers.
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("kind", &self.kind)
            .field("sender_email", &self.sender_email)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .field("has_api_token", &self.api_token.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProviderSettings {
    /// Merge a resolved config and secret, applying defaults.
    pub fn from_resolved(
        resolved: &ResolvedSender,
        defaults: &DeliveryConfig,
    ) -> Result<Self, FactoryError> {
        let spec = &resolved.config.spec;
        let secret = &resolved.secret;
        let kind = ProviderKind::parse(&spec.provider)?;

        let api_token = secret
            .get("apiKey")
            .or_else(|| secret.get("token"))
            .or_else(|| match kind {
                ProviderKind::Resend => secret.get("password"),
                ProviderKind::NativeSmtp => None,
            })
            .map(str::to_string);

        Ok(Self {
            kind,
            sender_email: spec.sender_email.trim().to_string(),
            from_name: spec.from_name.clone().filter(|n| !n.trim().is_empty()),
            host: spec.domain.clone(),
            port: spec.port.unwrap_or(defaults.default_smtp_port),
            username: secret.get("username").map(str::to_string),
            password: secret.get("password").map(str::to_string),
            api_token,
            timeout: spec
                .timeout
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
        })
    }

    /// Parameter checks made before any network call.
    pub fn validate(&self) -> Result<(), FactoryError> {
        if self.sender_email.is_empty() {
            return Err(FactoryError::InvalidParameters("sender email is required".into()));
        }
        match self.kind {
            ProviderKind::NativeSmtp => {
                if self.host.as_deref().is_none_or(|h| h.trim().is_empty()) {
                    return Err(FactoryError::InvalidParameters("SMTP host is required".into()));
                }
                if self.port == 0 {
                    return Err(FactoryError::InvalidParameters("SMTP port must be non-zero".into()));
                }
            }
            ProviderKind::Resend => {
                if self.api_token.is_none() {
                    return Err(FactoryError::InvalidParameters(
                        "API token is required (secret key apiKey, token or password)".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Builds a transport from settings. Construction never touches the network.
pub trait TransportFactory: Send + Sync {
    type Transport: Transport;

    fn build(&self, settings: &ProviderSettings) -> Result<Self::Transport, FactoryError>;
}

/// Production factory for the built-in providers.
#[derive(Debug, Clone)]
pub struct ProviderFactory {
    resend_api_base: String,
}

impl ProviderFactory {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            resend_api_base: config.resend_api_base.clone(),
        }
    }
}

impl TransportFactory for ProviderFactory {
    type Transport = Provider;

    fn build(&self, settings: &ProviderSettings) -> Result<Provider, FactoryError> {
        settings.validate()?;
        match settings.kind {
            ProviderKind::NativeSmtp => SmtpProvider::from_settings(settings).map(Provider::Smtp),
            ProviderKind::Resend => ResendProvider::from_settings(settings)
                .map(|p| Provider::Resend(p.with_base_url(self.resend_api_base.clone()))),
        }
    }
}
