//! The dispatcher's link to its WIS: modem registration with ordered
//! fallback over the configured WIS URLs, heartbeat relay and unregistration.

use std::time::Duration;

use parking_lot::RwLock;

use crate::transport::NodeClient;
use crate::types::ModemRegistration;
use crate::wire::ManageModem;

pub struct WisLink {
    client: NodeClient,
    wis_urls: Vec<String>,
    retry: u32,
    retry_wait: Duration,
    active: RwLock<Option<String>>,
}

impl WisLink {
    pub fn new(client: NodeClient, wis_urls: Vec<String>, retry: u32, retry_wait: Duration) -> Self {
        Self {
            client,
            wis_urls,
            retry: retry.max(1),
            retry_wait,
            active: RwLock::new(None),
        }
    }

    /// The WIS that last accepted a registration.
    pub fn active(&self) -> Option<String> {
        self.active.read().clone()
    }

    /// Try every WIS URL in order, each up to `retry` times, until one
    /// answers `request` with 200. That URL becomes the active WIS.
    async fn loop_wis(&self, request: &ManageModem) -> Option<String> {
        for url in &self.wis_urls {
            for attempt in 1..=self.retry {
                let code = self.client.manage_modem(url, request).await;
                if code == 200 {
                    *self.active.write() = Some(url.clone());
                    return Some(url.clone());
                }
                tracing::warn!(
                    "⚠️  WIS {} answered {} (attempt {}/{})",
                    url,
                    code,
                    attempt,
                    self.retry
                );
                if attempt < self.retry {
                    tokio::time::sleep(self.retry_wait).await;
                }
            }
        }
        None
    }

    /// Register every modem. Returns false as soon as one modem cannot be
    /// registered at any WIS.
    pub async fn register(&self, modems: &[ModemRegistration]) -> bool {
        for modem in modems {
            let request = ManageModem::Register(modem.clone());
            match self.loop_wis(&request).await {
                Some(url) => tracing::info!(
                    "📶 Modem {} registered at {} as route {}",
                    modem.modem_id,
                    url,
                    modem.route_id
                ),
                None => {
                    tracing::error!("❌ Unable to register modem {} to any WIS", modem.modem_id);
                    return false;
                }
            }
        }
        true
    }

    /// Best-effort withdrawal of the given modems' routes.
    pub async fn unregister(&self, modems: &[ModemRegistration]) {
        for modem in modems {
            let request = ManageModem::Unregister {
                route_id: modem.route_id.clone(),
            };
            if self.loop_wis(&request).await.is_none() {
                tracing::warn!("⚠️  Could not unregister route {}", modem.route_id);
            }
        }
    }

    /// Relay a route heartbeat to the active WIS and return its HTTP code.
    pub async fn heartbeat(&self, route_id: &str) -> u16 {
        match self.active() {
            Some(url) => self.client.heartbeat(&url, route_id).await,
            None => 500,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;

    fn link(urls: Vec<String>) -> WisLink {
        let client = NodeClient::new(
            Codec::new("k"),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();
        WisLink::new(client, urls, 2, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_unreachable_wis_fails_registration() {
        let link = link(vec![
            "http://127.0.0.1:9".to_string(),
            "http://127.0.0.1:9/".to_string(),
        ]);
        let modem = ModemRegistration {
            modem_id: "m1".to_string(),
            number_pattern: ".*".to_string(),
            label: String::new(),
            load_factor: 1,
            delivery_url: "http://127.0.0.1:7788".to_string(),
            route_id: "r1".to_string(),
        };
        assert!(!link.register(&[modem]).await);
        assert_eq!(link.active(), None);
        assert_eq!(link.heartbeat("r1").await, 500);
    }

    #[tokio::test]
    async fn test_empty_registration_succeeds() {
        assert!(link(vec![]).register(&[]).await);
    }
}
