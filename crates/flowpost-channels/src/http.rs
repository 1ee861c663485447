//! Provider HTTP API gateway.
//!
//! POSTs `{to, from, from_name, subject, html, tags}` as JSON with a bearer
//! key. The provider's message id comes from the `x-message-id` response
//! header, falling back to an `id` / `messageId` field in the JSON body.

use std::time::Duration;

use async_trait::async_trait;
use flowpost_core::config::HttpDeliveryConfig;
use flowpost_core::{FlowpostError, MessageGateway, OutboundEmail, Result, SendReceipt};

/// Longest error-body excerpt carried into a failure code.
const BODY_EXCERPT_CHARS: usize = 200;

pub struct HttpGateway {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpGateway {
    pub fn new(config: &HttpDeliveryConfig) -> Result<Self> {
        let url = config.url.trim();
        if url.is_empty() {
            return Err(FlowpostError::Config("delivery.http.url is not set".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| FlowpostError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
            api_key: config.api_key.trim().to_string(),
        })
    }
}

pub fn payload(email: &OutboundEmail) -> serde_json::Value {
    serde_json::json!({
        "to": email.to,
        "from": email.from.from_email,
        "from_name": email.from.from_name,
        "subject": email.subject,
        "html": email.html,
        "tags": email.tags,
    })
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(BODY_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

fn id_from_body(body: &serde_json::Value) -> Option<String> {
    ["id", "messageId", "message_id"]
        .iter()
        .find_map(|k| body[*k].as_str())
        .map(String::from)
}

#[async_trait]
impl MessageGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt> {
        let mut request = self.client.post(&self.url).json(&payload(email));
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FlowpostError::Gateway(format!("request failed: {e}")))?;

        let status = response.status();
        let header_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(FlowpostError::Gateway(format!(
                "{} {}",
                status.as_u16(),
                excerpt(&text)
            )));
        }

        let provider_message_id = header_id.or_else(|| {
            serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| id_from_body(&v))
        });
        tracing::debug!("Provider accepted mail for {} ({:?})", email.to, provider_message_id);
        Ok(SendReceipt { provider_message_id })
    }
}
