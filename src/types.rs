//! Core records shared by the gateway roles: messages, route entries and
//! modem registrations.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_APP_ID;

/// Current UTC time as unix seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fresh opaque identifier (128 random bits, hex).
pub fn new_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Strip leading zeros and make sure the number carries a leading `+`.
pub fn normalize_number(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('0');
    if trimmed.starts_with('+') {
        trimmed.to_string()
    } else {
        format!("+{}", trimmed)
    }
}

/// Delivery lifecycle. The numeric codes are user visible and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum MessageStatus {
    New,
    DelegatedIn,
    DelegateOk,
    SentDirectOk,
    SentDelegatedOk,
    DirectTransportError,
    DelegateError,
    NoRoute,
    SendError,
    RouteLost,
}

impl MessageStatus {
    pub fn code(self) -> u16 {
        match self {
            MessageStatus::New => 0,
            MessageStatus::DelegatedIn => 1,
            MessageStatus::DelegateOk => 3,
            MessageStatus::SentDirectOk => 4,
            MessageStatus::SentDelegatedOk => 5,
            MessageStatus::DirectTransportError => 100,
            MessageStatus::DelegateError => 103,
            MessageStatus::NoRoute => 104,
            MessageStatus::SendError => 105,
            MessageStatus::RouteLost => 106,
        }
    }

    /// Statuses the watchdog still has to act on.
    pub fn is_pending(self) -> bool {
        matches!(self, MessageStatus::New | MessageStatus::DelegatedIn)
    }
}

impl From<MessageStatus> for u16 {
    fn from(status: MessageStatus) -> u16 {
        status.code()
    }
}

impl TryFrom<u16> for MessageStatus {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => MessageStatus::New,
            1 => MessageStatus::DelegatedIn,
            3 => MessageStatus::DelegateOk,
            4 => MessageStatus::SentDirectOk,
            5 => MessageStatus::SentDelegatedOk,
            100 => MessageStatus::DirectTransportError,
            103 => MessageStatus::DelegateError,
            104 => MessageStatus::NoRoute,
            105 => MessageStatus::SendError,
            106 => MessageStatus::RouteLost,
            other => return Err(format!("unknown message status {}", other)),
        })
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// An outbound SMS as persisted by a WIS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub target_number: String,
    pub content: String,
    pub priority: u8,
    pub app_id: String,
    pub source_ip: String,
    pub forwarded_for: String,
    pub submitted_at: i64,
    pub status: MessageStatus,
    pub status_changed_at: i64,
    pub modem_id: String,
}

impl Message {
    pub fn from_submission(sub: Submission, source_ip: Option<String>) -> Self {
        let now = now_secs();
        let source_ip = source_ip.unwrap_or_default();
        let forwarded_for = sub
            .forwarded_for
            .filter(|f| !f.is_empty())
            .or_else(|| (!source_ip.is_empty()).then(|| source_ip.clone()))
            .unwrap_or_else(|| "null".to_string());

        Self {
            id: sub.id.filter(|id| !id.is_empty()).unwrap_or_else(new_token),
            target_number: normalize_number(&sub.target_number),
            content: sub.content,
            priority: sub.priority.min(2),
            app_id: sub
                .app_id
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| DEFAULT_APP_ID.to_string()),
            source_ip,
            forwarded_for,
            submitted_at: now,
            status: MessageStatus::New,
            status_changed_at: now,
            modem_id: String::new(),
        }
    }

    pub fn set_status(&mut self, status: MessageStatus) {
        self.status = status;
        self.status_changed_at = now_secs();
    }
}

/// Submission request accepted by the WIS API and the operator CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(default)]
    pub id: Option<String>,
    pub target_number: String,
    pub content: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub forwarded_for: Option<String>,
}

/// Answer to a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub id: String,
    pub status: MessageStatus,
    pub modem_id: String,
}

/// One (number pattern -> modem) binding in the gossiped routing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub route_id: String,
    pub owner_node_id: String,
    pub modem_id: String,
    pub number_pattern: String,
    /// Local state, never taken from gossip.
    #[serde(default)]
    pub load_count: u64,
    pub load_factor: u32,
    /// Base URL of the owning WIS (gossip, probes, delegation).
    pub owner_routing_url: String,
    /// Base URL of the dispatcher the modem node is attached to.
    pub delivery_url: String,
    pub modem_label: String,
    pub obsolescence: u8,
    pub refreshed_at: i64,
}

impl RouteEntry {
    /// Owned route created from a dispatcher's modem registration.
    pub fn from_registration(reg: &ModemRegistration, node_id: &str, routing_url: &str) -> Self {
        Self {
            route_id: reg.route_id.clone(),
            owner_node_id: node_id.to_string(),
            modem_id: reg.modem_id.clone(),
            number_pattern: reg.number_pattern.clone(),
            load_count: 0,
            load_factor: reg.load_factor,
            owner_routing_url: routing_url.to_string(),
            delivery_url: reg.delivery_url.clone(),
            modem_label: reg.label.clone(),
            obsolescence: 0,
            refreshed_at: now_secs(),
        }
    }

    pub fn load_ratio(&self) -> f64 {
        self.load_count as f64 / f64::from(self.load_factor.max(1))
    }
}

/// A modem announced by a modem node and registered upstream by its dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemRegistration {
    pub modem_id: String,
    pub number_pattern: String,
    pub label: String,
    pub load_factor: u32,
    #[serde(default)]
    pub delivery_url: String,
    #[serde(default)]
    pub route_id: String,
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number("00436641234567"), "+436641234567");
        assert_eq!(normalize_number("436641234567"), "+436641234567");
        assert_eq!(normalize_number("+436641234567"), "+436641234567");
        assert_eq!(normalize_number(" 0664 "), "+664");
    }

    #[test]
    fn test_status_codes_serialize_as_integers() {
        let json = serde_json::to_string(&MessageStatus::NoRoute).unwrap();
        assert_eq!(json, "104");
        let back: MessageStatus = serde_json::from_str("106").unwrap();
        assert_eq!(back, MessageStatus::RouteLost);
        assert!(serde_json::from_str::<MessageStatus>("2").is_err());
    }

    #[test]
    fn test_submission_defaults() {
        let msg = Message::from_submission(
            Submission {
                target_number: "0043660111".to_string(),
                content: "hi".to_string(),
                priority: 7,
                ..Default::default()
            },
            Some("10.0.0.9".to_string()),
        );
        assert!(!msg.id.is_empty());
        assert_eq!(msg.target_number, "+43660111");
        assert_eq!(msg.app_id, "legacy");
        assert_eq!(msg.forwarded_for, "10.0.0.9");
        assert_eq!(msg.priority, 2);
        assert_eq!(msg.status, MessageStatus::New);
        assert!(msg.modem_id.is_empty());

        let anon = Message::from_submission(
            Submission {
                target_number: "+1".to_string(),
                content: "x".to_string(),
                ..Default::default()
            },
            None,
        );
        assert_eq!(anon.forwarded_for, "null");
    }

    #[test]
    fn test_message_survives_bincode() {
        let msg = Message::from_submission(
            Submission {
                target_number: "+43".to_string(),
                content: "ä ♠".to_string(),
                priority: 1,
                ..Default::default()
            },
            None,
        );
        let bytes = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_load_ratio_guards_zero_factor() {
        let reg = ModemRegistration {
            modem_id: "m".into(),
            number_pattern: ".*".into(),
            label: "l".into(),
            load_factor: 0,
            delivery_url: String::new(),
            route_id: "r".into(),
        };
        let mut route = RouteEntry::from_registration(&reg, "wis1", "http://wis1");
        route.load_count = 4;
        assert_eq!(route.load_ratio(), 4.0);
    }
}
