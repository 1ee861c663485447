//! # Flowpost Core
//!
//! Shared configuration, error type, domain records and the collaborator
//! traits the flow engine consumes (recipient store, sender identity,
//! email content and the message-send gateway).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::FlowpostConfig;
pub use error::{FlowpostError, Result};
pub use traits::{ContentResolver, MessageGateway, RecipientStore, SenderResolver};
pub use types::{CorrelationTags, OutboundEmail, Recipient, SendReceipt, SenderIdentity};
