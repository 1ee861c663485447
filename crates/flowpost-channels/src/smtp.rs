//! SMTP gateway: HTML mail over a STARTTLS relay (async lettre).
//!
//! Every message carries a generated `Message-ID`, which is also the
//! receipt's provider id, and an `X-Flowpost-Tags` header with the
//! correlation tags as JSON.

use async_trait::async_trait;
use flowpost_core::config::SmtpConfig;
use flowpost_core::{FlowpostError, MessageGateway, OutboundEmail, Result, SendReceipt};
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// `X-Flowpost-Tags: {"flow_id":…,"node_id":…,…}`
#[derive(Debug, Clone, PartialEq)]
pub struct FlowpostTagsHeader(String);

impl Header for FlowpostTagsHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Flowpost-Tags")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

pub struct SmtpGateway {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpGateway {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let host = config.host.trim();
        if host.is_empty() {
            return Err(FlowpostError::Config("delivery.smtp.host is not set".into()));
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| FlowpostError::Config(format!("SMTP relay {host}: {e}")))?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            mailer: builder.build(),
            host: host.to_string(),
        })
    }
}

/// Build the MIME message and its Message-ID.
pub fn build_message(email: &OutboundEmail) -> Result<(Message, String)> {
    let from_addr: Address = email
        .from
        .from_email
        .trim()
        .parse()
        .map_err(|e| FlowpostError::Gateway(format!("Invalid from: {e}")))?;
    let to_addr: Address = email
        .to
        .trim()
        .parse()
        .map_err(|e| FlowpostError::Gateway(format!("Invalid to: {e}")))?;

    let from_name = email.from.from_name.trim();
    let from = Mailbox::new(
        (!from_name.is_empty()).then(|| from_name.to_string()),
        from_addr.clone(),
    );
    let message_id = format!("<{}@{}>", uuid::Uuid::new_v4(), from_addr.domain());
    let tags = serde_json::to_string(&email.tags)?;

    let message = Message::builder()
        .from(from)
        .to(Mailbox::new(None, to_addr))
        .subject(email.subject.clone())
        .message_id(Some(message_id.clone()))
        .header(FlowpostTagsHeader(tags))
        .header(ContentType::TEXT_HTML)
        .body(email.html.clone())
        .map_err(|e| FlowpostError::Gateway(format!("Build email: {e}")))?;

    Ok((message, message_id))
}

#[async_trait]
impl MessageGateway for SmtpGateway {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt> {
        let (message, message_id) = build_message(email)?;
        self.mailer
            .send(message)
            .await
            .map_err(|e| FlowpostError::Gateway(format!("SMTP send via {}: {e}", self.host)))?;

        tracing::debug!("SMTP accepted {message_id} for {}", email.to);
        Ok(SendReceipt {
            provider_message_id: Some(message_id),
        })
    }
}
