//! Domain records shared between the engine and its collaborators.

use serde::{Deserialize, Serialize};

/// A contact a run sends to. Owned by exactly one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Recipient {
    /// Trimmed, non-empty address.
    pub fn address(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

/// The From identity an email goes out with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub from_email: String,
    #[serde(default)]
    pub from_name: String,
}

/// Tags attached to every outbound message so delivery events can be
/// attributed back to the run and node that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationTags {
    pub flow_id: String,
    pub node_id: String,
    pub run_id: String,
    pub owner_id: String,
    pub recipient_id: String,
}

/// One fully resolved message, ready for a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub from: SenderIdentity,
    pub subject: String,
    pub html: String,
    pub tags: CorrelationTags,
}

/// What a gateway reports back on acceptance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(default)]
    pub provider_message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient_address_trims() {
        let mut r = Recipient {
            id: "r1".into(),
            owner_id: "u1".into(),
            email: Some("  a@b.co ".into()),
            name: None,
        };
        assert_eq!(r.address(), Some("a@b.co"));

        r.email = Some("   ".into());
        assert_eq!(r.address(), None);

        r.email = None;
        assert_eq!(r.address(), None);
    }
}
