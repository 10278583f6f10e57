//! JSON bodies exchanged between nodes. Every body travels as a codec token.

use serde::{Deserialize, Serialize};

use crate::types::{Message, ModemRegistration};

pub const API_PREFIX: &str = "/smsgateway/api";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateRequest {
    pub sms: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub route_id: String,
}

/// `{"get": "peers"}` asks for the full routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub get: String,
}

impl RoutingRequest {
    pub fn peers() -> Self {
        Self {
            get: "peers".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogRequest {
    pub run: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatusRequest {
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStatus {
    pub router: String,
    pub watchdog: String,
}

/// Message history for one UTC day (`YYYY-MM-DD`, today when absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub get: String,
    #[serde(default)]
    pub date: Option<String>,
}

/// Modem route management requested by a dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ManageModem {
    Register(ModemRegistration),
    Unregister {
        #[serde(rename = "routeId")]
        route_id: String,
    },
}

/// Envelopes on the dispatcher <-> modem node session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum SessionEnvelope {
    /// Sent by the modem node on open; echoed back by the dispatcher with
    /// `status = "registered"` and route ids filled in.
    Register {
        node_id: String,
        modems: Vec<ModemRegistration>,
        protocol: String,
        #[serde(default)]
        status: Option<String>,
    },
    /// Route refresh from the modem node; the dispatcher echoes it with the
    /// HTTP code the WIS answered.
    Heartbeat {
        route_id: String,
        #[serde(default)]
        code: Option<u16>,
    },
    Sendsms {
        sms: Message,
    },
    Status {
        message_id: String,
        status: String,
    },
}

/// Frames queued for a session's writer task, on either end of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close(u16, String),
}

// ─── Tests ───────────────────────────────────────────────────────────
