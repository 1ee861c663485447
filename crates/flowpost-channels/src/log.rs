//! Dry-run gateway: logs the message instead of sending it.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use flowpost_core::{MessageGateway, OutboundEmail, Result, SendReceipt};

#[derive(Default)]
pub struct LogGateway {
    sent: AtomicUsize,
}

impl LogGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "sent" since startup.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageGateway for LogGateway {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt> {
        let id = format!("log-{}", uuid::Uuid::new_v4().simple());
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "📝 [dry-run] '{}' from {} to {} (flow={} node={} run={}, {} bytes html) id={id}",
            email.subject,
            email.from.from_email,
            email.to,
            email.tags.flow_id,
            email.tags.node_id,
            email.tags.run_id,
            email.html.len()
        );
        Ok(SendReceipt {
            provider_message_id: Some(id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpost_core::{CorrelationTags, SenderIdentity};

    #[tokio::test]
    async fn test_log_gateway_counts_and_ids() {
        let gw = LogGateway::new();
        let email = OutboundEmail {
            to: "a@example.com".into(),
            from: SenderIdentity {
                from_email: "me@example.com".into(),
                from_name: String::new(),
            },
            subject: "s".into(),
            html: "<p/>".into(),
            tags: CorrelationTags {
                flow_id: "f".into(),
                node_id: "n".into(),
                run_id: "r".into(),
                owner_id: "o".into(),
                recipient_id: "x".into(),
            },
        };

        let a = gw.send(&email).await.unwrap();
        let b = gw.send(&email).await.unwrap();
        assert_eq!(gw.sent_count(), 2);
        assert!(a.provider_message_id.unwrap().starts_with("log-"));
        assert_ne!(b.provider_message_id, None);
    }
}
