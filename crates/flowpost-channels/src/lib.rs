//! # Flowpost Channels
//! Outbound delivery gateways behind the `MessageGateway` trait.
//!
//! | mode   | gateway        | transport                        |
//! |--------|----------------|----------------------------------|
//! | `smtp` | `SmtpGateway`  | lettre, STARTTLS relay           |
//! | `http` | `HttpGateway`  | reqwest JSON POST to a provider  |
//! | `log`  | `LogGateway`   | tracing only (dry run)           |

pub mod http;
pub mod log;
pub mod smtp;

use std::sync::Arc;

use flowpost_core::config::{DeliveryConfig, DeliveryMode};
use flowpost_core::{MessageGateway, Result};

pub use http::HttpGateway;
pub use log::LogGateway;
pub use smtp::SmtpGateway;

/// Build the gateway selected by `[delivery] mode`.
pub fn build_gateway(config: &DeliveryConfig) -> Result<Arc<dyn MessageGateway>> {
    let gateway: Arc<dyn MessageGateway> = match config.mode {
        DeliveryMode::Smtp => Arc::new(SmtpGateway::new(&config.smtp)?),
        DeliveryMode::Http => Arc::new(HttpGateway::new(&config.http)?),
        DeliveryMode::Log => Arc::new(LogGateway::new()),
    };
    tracing::info!("📮 Delivery gateway: {}", gateway.name());
    Ok(gateway)
}
