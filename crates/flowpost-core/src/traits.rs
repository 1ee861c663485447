//! Collaborator interfaces consumed by the flow engine.
//!
//! The engine never talks to a concrete store or provider directly; the
//! SQLite store and the delivery channels implement these.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{OutboundEmail, Recipient, SendReceipt, SenderIdentity};

/// Read-only access to recipient records.
pub trait RecipientStore: Send + Sync {
    fn get_recipient(&self, id: &str) -> Result<Option<Recipient>>;
}

/// Resolves the default From identity of an owner account.
pub trait SenderResolver: Send + Sync {
    /// `Ok(None)` means "not configured".
    fn sender_for(&self, owner_id: &str) -> Result<Option<SenderIdentity>>;
}

/// Resolves referenced (non-inline) email bodies.
pub trait ContentResolver: Send + Sync {
    fn resolve_html(&self, owner_id: &str, html_ref: &str) -> Result<Option<String>>;
}

/// Message-send gateway. Accepts one message, attempted once.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Short name for logs (`smtp`, `http`, `log`).
    fn name(&self) -> &str;

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt>;
}
