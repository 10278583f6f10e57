//! Connected modem-node sessions and the bridge between a synchronous
//! submission and the asynchronous delivery result on a session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::constants::delivery_result;
use crate::types::ModemRegistration;
use crate::wire::Outbound;

struct Pending {
    status: String,
    waiter: Option<oneshot::Sender<String>>,
}

struct SessionEntry {
    node_id: String,
    modems: Vec<ModemRegistration>,
    sender: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<String, Pending>>,
}

/// Result of handing a message to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Error(String),
    Timeout,
    NoSession,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SocketAddr, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Track a freshly opened session with an empty modem list.
    pub fn open(&self, addr: SocketAddr, sender: mpsc::UnboundedSender<Outbound>) {
        self.sessions.insert(
            addr,
            SessionEntry {
                node_id: String::new(),
                modems: Vec::new(),
                sender,
                pending: Mutex::new(HashMap::new()),
            },
        );
        tracing::debug!("🔌 Session opened from {} ({} active)", addr, self.sessions.len());
    }

    pub fn register(&self, addr: SocketAddr, node_id: &str, modems: Vec<ModemRegistration>) {
        if let Some(mut entry) = self.sessions.get_mut(&addr) {
            entry.node_id = node_id.to_string();
            entry.modems = modems;
        }
    }

    /// The session currently serving `modem_id`.
    pub fn find_session(&self, modem_id: &str) -> Option<SocketAddr> {
        self.sessions
            .iter()
            .find(|e| e.modems.iter().any(|m| m.modem_id == modem_id))
            .map(|e| *e.key())
    }

    pub fn send(&self, addr: &SocketAddr, frame: Outbound) -> bool {
        match self.sessions.get(addr) {
            Some(entry) => entry.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Send `token` on the session serving `modem_id` and wait up to
    /// `max_wait` for the delivery result of `message_id`. The pending
    /// record is always removed before returning.
    pub async fn deliver(
        &self,
        modem_id: &str,
        message_id: &str,
        token: String,
        max_wait: Duration,
    ) -> DeliveryOutcome {
        let Some(addr) = self.find_session(modem_id) else {
            return DeliveryOutcome::NoSession;
        };

        let (tx, rx) = oneshot::channel();
        {
            let Some(entry) = self.sessions.get(&addr) else {
                return DeliveryOutcome::NoSession;
            };
            entry.pending.lock().insert(
                message_id.to_string(),
                Pending {
                    status: delivery_result::SENT.to_string(),
                    waiter: Some(tx),
                },
            );
            if entry.sender.send(Outbound::Text(token)).is_err() {
                entry.pending.lock().remove(message_id);
                return DeliveryOutcome::NoSession;
            }
        }

        let outcome = match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(status)) if status == delivery_result::SUCCESS => DeliveryOutcome::Success,
            Ok(Ok(status)) => DeliveryOutcome::Error(status),
            // waiter dropped: the session closed underneath us
            Ok(Err(_)) => DeliveryOutcome::NoSession,
            Err(_) => DeliveryOutcome::Timeout,
        };

        if let Some(entry) = self.sessions.get(&addr) {
            entry.pending.lock().remove(message_id);
        }
        outcome
    }

    /// Record a delivery result written by the modem node. Terminal results
    /// release the waiting submission.
    pub fn record_status(&self, addr: &SocketAddr, message_id: &str, status: &str) -> bool {
        let Some(entry) = self.sessions.get(addr) else {
            return false;
        };
        let mut pending = entry.pending.lock();
        let Some(record) = pending.get_mut(message_id) else {
            tracing::debug!("Late status {} for message {} ignored", status, message_id);
            return false;
        };
        record.status = status.to_string();
        if status == delivery_result::SUCCESS || status == delivery_result::ERROR {
            if let Some(waiter) = record.waiter.take() {
                let _ = waiter.send(status.to_string());
            }
        }
        true
    }

    pub fn pending_status(&self, addr: &SocketAddr, message_id: &str) -> Option<String> {
        self.sessions
            .get(addr)
            .and_then(|e| e.pending.lock().get(message_id).map(|p| p.status.clone()))
    }

    /// Forget a session. Returns its node id and modems for unregistration.
    pub fn close(&self, addr: &SocketAddr) -> Option<(String, Vec<ModemRegistration>)> {
        let (_, entry) = self.sessions.remove(addr)?;
        tracing::debug!(
            "🔌 Session {} closed ({} active)",
            addr,
            self.sessions.len()
        );
        Some((entry.node_id, entry.modems))
    }

    /// Every registered modem across all sessions, for shutdown unregistration.
    pub fn drain_all(&self) -> Vec<ModemRegistration> {
        let addrs: Vec<SocketAddr> = self.sessions.iter().map(|e| *e.key()).collect();
        addrs
            .iter()
            .filter_map(|addr| self.close(addr))
            .flat_map(|(_, modems)| modems)
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
