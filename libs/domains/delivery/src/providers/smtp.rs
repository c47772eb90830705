//! Direct SMTP delivery using lettre.
//!
//! One connection per call. STARTTLS is used when the server offers it and
//! AUTH only when credentials are present.

use super::{Transport, TransportError, TransportRequest, TransportResult};
use crate::factory::{FactoryError, ProviderSettings};
use async_trait::async_trait;
use lettre::{
    message::{
        header::{ContentType, HeaderName, HeaderValue},
        Mailbox, MultiPart,
    },
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
        Error as SmtpError,
    },
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
    /// Right-hand side of generated `Message-ID`s.
    id_domain: String,
    timeout: Duration,
}

impl SmtpProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, FactoryError> {
        let host = settings
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FactoryError::InvalidParameters("SMTP host is required".into()))?;

        let tls = TlsParameters::new(host.to_string()).map_err(|e| {
            FactoryError::InvalidParameters(format!("Invalid TLS parameters for {host}: {e}"))
        })?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(settings.port)
            .tls(Tls::Opportunistic(tls))
            .timeout(Some(settings.timeout));

        if let Some(username) = settings.username.as_deref().filter(|u| !u.is_empty()) {
            let password = settings.password.clone().unwrap_or_default();
            builder = builder.credentials(Credentials::new(username.to_string(), password));
        }

        let id_domain = settings
            .sender_email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_string())
            .unwrap_or_else(|| host.to_string());

        Ok(Self {
            transport: builder.build(),
            host: host.to_string(),
            port: settings.port,
            id_domain,
            timeout: settings.timeout,
        })
    }

    fn message_id(&self, hint: &str) -> String {
        format!("<{}@{}>", hint, self.id_domain)
    }

    fn build_message(&self, request: &TransportRequest, message_id: &str) -> Result<Message, TransportError> {
        let from = mailbox(request.from_name.as_deref(), &request.from, "from")?;
        let to = mailbox(request.to_name.as_deref(), &request.to, "to")?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(request.subject.as_str())
            .message_id(Some(message_id.to_string()));

        if let Some(reply_to) = &request.reply_to {
            builder = builder.reply_to(mailbox(None, reply_to, "reply-to")?);
        }
        for cc in &request.cc {
            builder = builder.cc(mailbox(None, cc, "cc")?);
        }
        for bcc in &request.bcc {
            builder = builder.bcc(mailbox(None, bcc, "bcc")?);
        }
        for (name, value) in &request.headers {
            let header = HeaderName::new_from_ascii(name.clone()).map_err(|e| {
                TransportError::permanent(format!("Invalid header name '{name}': {e}"))
            })?;
            builder = builder.raw_header(HeaderValue::new(header, value.clone()));
        }

        let built = match &request.html_body {
            Some(html) if request.text_body.is_empty() => builder
                .header(ContentType::TEXT_HTML)
                .body(html.clone()),
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                request.text_body.clone(),
                html.clone(),
            )),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(request.text_body.clone()),
        };

        built.map_err(|e| TransportError::permanent(format!("Failed to build message: {e}")))
    }
}

fn mailbox(name: Option<&str>, email: &str, field: &str) -> Result<Mailbox, TransportError> {
    let address: Address = email
        .parse()
        .map_err(|e| TransportError::permanent(format!("Invalid {field} address '{email}': {e}")))?;
    Ok(Mailbox::new(name.map(str::to_string), address))
}

/// 4xx replies and network trouble are worth retrying; 5xx replies and
/// client-side errors are not.
fn classify(err: &SmtpError) -> TransportError {
    let message = format!("SMTP error: {err}");
    let classified = if err.is_permanent() || err.is_client() {
        TransportError::permanent(message)
    } else {
        TransportError::transient(message)
    };

    match err.status().and_then(|code| code.to_string().parse::<u16>().ok()) {
        Some(code) => classified.with_status(code),
        None => classified,
    }
}

#[async_trait]
impl Transport for SmtpProvider {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResult, TransportError> {
        let message_id = self.message_id(&request.message_id);
        let message = self.build_message(request, &message_id)?;

        debug!(
            to = %request.to,
            host = %self.host,
            port = self.port,
            cc_count = request.cc.len(),
            bcc_count = request.bcc.len(),
            "Sending email via SMTP"
        );

        // lettre's own timeout does not cover every read on async streams
        let response = tokio::time::timeout(self.timeout, self.transport.send(message))
            .await
            .map_err(|_| TransportError::timeout(self.timeout))?
            .map_err(|e| {
                let err = classify(&e);
                warn!(to = %request.to, error = %e, kind = %err.kind, "SMTP send failed");
                err
            })?;

        let detail = response.message().collect::<Vec<_>>().join(" ");
        info!(to = %request.to, message_id = %message_id, "Email accepted by SMTP server");

        Ok(TransportResult::accepted(message_id).with_detail(detail))
    }

    async fn verify_credentials(&self) -> Result<(), TransportError> {
        let connected = tokio::time::timeout(self.timeout, self.transport.test_connection())
            .await
            .map_err(|_| TransportError::timeout(self.timeout))?
            .map_err(|e| classify(&e))?;

        if connected {
            Ok(())
        } else {
            Err(TransportError::transient(format!(
                "SMTP server {}:{} did not answer NOOP",
                self.host, self.port
            )))
        }
    }

    fn name(&self) -> &'static str {
        "native-smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ProviderKind;
    use crate::providers::FailureKind;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Minimal SMTP peer: no STARTTLS, no AUTH, fixed reply to RCPT.
    /// Resolves to the DATA lines it received.
    async fn scripted_server(rcpt_reply: &'static str) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut data = Vec::new();
            let mut in_data = false;

            let _ = write.write_all(b"220 scripted ESMTP ready\r\n").await;
            while let Ok(Some(line)) = lines.next_line().await {
                if in_data {
                    if line == "." {
                        in_data = false;
                        let _ = write.write_all(b"250 2.0.0 queued as scripted-1\r\n").await;
                    } else {
                        data.push(line);
                    }
                    continue;
                }

                let verb = line
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase();
                let reply = match verb.as_str() {
                    "EHLO" | "HELO" => "250-scripted\r\n250 8BITMIME\r\n",
                    "MAIL" | "NOOP" | "RSET" => "250 2.1.0 ok\r\n",
                    "RCPT" => rcpt_reply,
                    "DATA" => {
                        in_data = true;
                        "354 end with <CRLF>.<CRLF>\r\n"
                    }
                    "QUIT" => {
                        let _ = write.write_all(b"221 2.0.0 bye\r\n").await;
                        break;
                    }
                    _ => "502 5.5.2 not implemented\r\n",
                };
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            data
        });

        (port, handle)
    }

    fn settings(port: u16, timeout: Duration) -> ProviderSettings {
        ProviderSettings {
            kind: ProviderKind::NativeSmtp,
            sender_email: "noreply@acme.test".into(),
            from_name: Some("Acme".into()),
            host: Some("127.0.0.1".into()),
            port,
            username: None,
            password: None,
            api_token: None,
            timeout,
        }
    }

    fn request() -> TransportRequest {
        let mut headers = BTreeMap::new();
        headers.insert("X-Priority".to_string(), "1 (Highest)".to_string());

        TransportRequest {
            message_id: "welcome-ada".into(),
            from: "noreply@acme.test".into(),
            from_name: Some("Acme".into()),
            to: "ada@example.com".into(),
            to_name: Some("Ada".into()),
            subject: "Welcome aboard".into(),
            text_body: "Hello Ada".into(),
            html_body: None,
            reply_to: Some("support@acme.test".into()),
            cc: vec!["ops@acme.test".into()],
            bcc: Vec::new(),
            headers,
        }
    }

    #[tokio::test]
    async fn test_send_speaks_smtp_dialog() {
        let (port, server) = scripted_server("250 2.1.5 ok\r\n").await;
        let provider = SmtpProvider::from_settings(&settings(port, Duration::from_secs(5))).unwrap();

        let result = provider.send(&request()).await.unwrap();
        assert_eq!(result.message_id, "<welcome-ada@acme.test>");

        let data = server.await.unwrap().join("\n");
        assert!(data.contains("Subject: Welcome aboard"));
        assert!(data.contains("Message-ID: <welcome-ada@acme.test>"));
        assert!(data.contains("X-Priority: 1 (Highest)"));
        assert!(data.contains("Reply-To: support@acme.test"));
        assert!(data.contains("Hello Ada"));
    }

    #[tokio::test]
    async fn test_rejected_recipient_is_permanent() {
        let (port, _server) = scripted_server("550 5.1.1 mailbox unavailable\r\n").await;
        let provider = SmtpProvider::from_settings(&settings(port, Duration::from_secs(5))).unwrap();

        let err = provider.send(&request()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
        assert_eq!(err.status_code, Some(550));
    }

    #[tokio::test]
    async fn test_greylisting_is_transient() {
        let (port, _server) = scripted_server("451 4.7.1 try again later\r\n").await;
        let provider = SmtpProvider::from_settings(&settings(port, Duration::from_secs(5))).unwrap();

        let err = provider.send(&request()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(err.status_code, Some(451));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _silent = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let provider =
            SmtpProvider::from_settings(&settings(port, Duration::from_millis(300))).unwrap();
        let err = provider.send(&request()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_verify_runs_noop() {
        let (port, _server) = scripted_server("250 ok\r\n").await;
        let provider = SmtpProvider::from_settings(&settings(port, Duration::from_secs(5))).unwrap();
        provider.verify_credentials().await.unwrap();
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let mut settings = settings(25, Duration::from_secs(1));
        settings.host = Some("  ".into());
        assert!(matches!(
            SmtpProvider::from_settings(&settings),
            Err(FactoryError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let provider = SmtpProvider::from_settings(&settings(25, Duration::from_secs(1))).unwrap();
        let mut bad = request();
        bad.to = "not-an-address".into();

        let err = provider.send(&bad).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }
}
