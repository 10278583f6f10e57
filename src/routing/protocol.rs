//! Periodic gossip of the routing table between WIS nodes.
//!
//! Each tick ages the table, purges terminal rows, pushes the full table to
//! every known peer and, every few ticks, probes peer reachability. Ticks run
//! on a single task so they never overlap.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use super::store::RouteStore;
use crate::transport::NodeClient;
use crate::types::now_secs;

pub struct RoutingProtocol {
    store: Arc<RouteStore>,
    client: NodeClient,
    own_url: String,
    peers: Vec<String>,
    interval: Duration,
    stale_after: i64,
    probe_every: u32,
}

impl RoutingProtocol {
    pub fn new(
        store: Arc<RouteStore>,
        client: NodeClient,
        own_url: impl Into<String>,
        peers: Vec<String>,
        interval: Duration,
        stale_after: i64,
        probe_every: u32,
    ) -> Self {
        Self {
            store,
            client,
            own_url: own_url.into(),
            peers,
            interval,
            stale_after,
            probe_every: probe_every.max(1),
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::info!(
            "🧭 Routing protocol started (interval {:?}, {} static peers)",
            self.interval,
            self.peers.len()
        );

        self.pull_from_peers().await;

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut rounds_since_probe: u32 = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("🛑 Routing protocol shutting down");
                    break;
                }
                _ = interval.tick() => {
                    rounds_since_probe += 1;
                    let probe = rounds_since_probe >= self.probe_every;
                    if probe {
                        rounds_since_probe = 0;
                    }
                    self.tick(now_secs(), probe).await;
                }
            }
        }
    }

    /// One protocol round.
    pub async fn tick(&self, now: i64, probe: bool) {
        let aged = self.store.age(now, self.stale_after);
        let purged = self.store.purge();
        if aged > 0 || purged > 0 {
            tracing::debug!("🧭 Aged {} routes, purged {}", aged, purged);
        }

        if self.store.is_empty() {
            self.pull_from_peers().await;
        }

        self.broadcast().await;

        if probe {
            self.probe_peers().await;
        }
    }

    /// Request the full table from every configured peer and merge it.
    pub async fn pull_from_peers(&self) {
        for peer in &self.peers {
            match self.client.request_routes(peer).await {
                Ok(routes) => {
                    let outcome = self.store.merge(routes);
                    tracing::info!(
                        "✓ Pulled routes from {} ({} new, {} updated)",
                        peer,
                        outcome.inserted,
                        outcome.updated
                    );
                }
                Err(e) => tracing::debug!("Route pull from {} failed: {}", peer, e),
            }
        }
    }

    /// Broadcast targets: static peers plus the owners of remote routes,
    /// never this node.
    pub fn broadcast_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for url in self.peers.iter().cloned().chain(self.store.remote_owner_urls()) {
            if url != self.own_url && !targets.contains(&url) {
                targets.push(url);
            }
        }
        targets
    }

    pub async fn broadcast(&self) {
        let table = self.store.read();
        let targets = self.broadcast_targets();

        let sends = targets.iter().map(|url| {
            let table = &table;
            async move { (url, self.client.send_routes(url, table).await) }
        });

        for (url, result) in join_all(sends).await {
            if let Err(e) = result {
                tracing::debug!("Gossip to {} failed: {}", url, e);
            }
        }
    }

    /// Health-check static peers and every owner URL in the table; withdraw
    /// all routes of owners that do not answer.
    pub async fn probe_peers(&self) {
        let mut targets: Vec<String> = Vec::new();
        for url in self.peers.iter().cloned().chain(self.store.owner_urls()) {
            if url != self.own_url && !targets.contains(&url) {
                targets.push(url);
            }
        }

        let probes = targets.iter().map(|url| async move {
            (url, self.client.probe(url).await)
        });

        for (url, result) in join_all(probes).await {
            if let Err(e) = result {
                let withdrawn = self.store.withdraw_owner_url(url);
                if withdrawn > 0 {
                    tracing::warn!(
                        "⚠️  Peer {} unreachable ({}), withdrew {} routes",
                        url,
                        e,
                        withdrawn
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::types::RouteEntry;

    fn route(route_id: &str, owner: &str, url: &str) -> RouteEntry {
        RouteEntry {
            route_id: route_id.to_string(),
            owner_node_id: owner.to_string(),
            modem_id: format!("modem-{}", route_id),
            number_pattern: ".*".to_string(),
            load_count: 0,
            load_factor: 1,
            owner_routing_url: url.to_string(),
            delivery_url: String::new(),
            modem_label: String::new(),
            obsolescence: 0,
            refreshed_at: now_secs(),
        }
    }

    fn protocol(store: Arc<RouteStore>, peers: Vec<String>) -> RoutingProtocol {
        let client = NodeClient::new(
            Codec::new("k"),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();
        RoutingProtocol::new(
            store,
            client,
            "http://127.0.0.1:1",
            peers,
            Duration::from_secs(25),
            30,
            5,
        )
    }

    #[test]
    fn test_broadcast_targets_exclude_self_and_dedupe() {
        let store = Arc::new(RouteStore::new("wis1"));
        store.upsert(route("a", "wis1", "http://127.0.0.1:1"), None);
        store.upsert(route("b", "wis2", "http://10.0.0.2:7777"), None);
        store.upsert(route("c", "wis3", "http://10.0.0.3:7777"), None);

        let proto = protocol(
            store,
            vec![
                "http://10.0.0.2:7777".to_string(),
                "http://127.0.0.1:1".to_string(),
            ],
        );
        assert_eq!(
            proto.broadcast_targets(),
            vec![
                "http://10.0.0.2:7777".to_string(),
                "http://10.0.0.3:7777".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_owner_is_withdrawn_by_probe() {
        let store = Arc::new(RouteStore::new("wis1"));
        // nothing listens on port 9 of the loopback interface
        store.upsert(route("b", "wis2", "http://127.0.0.1:9"), None);
        store.upsert(route("own", "wis1", "http://127.0.0.1:1"), None);

        let proto = protocol(store.clone(), vec![]);
        proto.probe_peers().await;

        let rows = store.read();
        assert_eq!(rows[0].obsolescence, 14);
        assert_eq!(rows[1].obsolescence, 0);
    }

    #[tokio::test]
    async fn test_tick_ages_and_purges() {
        let store = Arc::new(RouteStore::new("wis1"));
        let mut gone = route("gone", "wis1", "http://127.0.0.1:1");
        gone.refreshed_at = 0;
        store.upsert(gone.clone(), Some(0));
        store.set_obsolete("gone", 15);

        let proto = protocol(store.clone(), vec![]);
        proto.tick(now_secs(), false).await;
        assert!(store.is_empty());
    }
}
