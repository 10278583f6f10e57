//! In-memory routing table of one WIS.
//!
//! Rows are kept in insertion order and a re-upserted route keeps its
//! position, so every reader iterates the table in the order routes first
//! became known to this node. Load-balancing ties depend on that order.

use parking_lot::Mutex;

use super::obsolescence::Liveness;
use crate::constants::obsolescence::{MERGEABLE_BELOW, SELECTABLE_BELOW, WITHDRAWN};
use crate::types::{now_secs, RouteEntry};

/// Result of merging a peer's table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub updated: usize,
    pub inserted: usize,
    pub skipped: usize,
}

pub struct RouteStore {
    node_id: String,
    routes: Mutex<Vec<RouteEntry>>,
}

impl RouteStore {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            routes: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }

    /// Insert or replace a route. `load_count` is never taken from the
    /// argument: it is kept from the existing row (same route id, else same
    /// owner/modem pair). A route with no prior load record resets every
    /// counter in the table.
    pub fn upsert(&self, route: RouteEntry, changed_at: Option<i64>) {
        let mut routes = self.routes.lock();
        upsert_locked(&mut routes, route, changed_at.unwrap_or_else(now_secs));
    }

    /// Snapshot of the whole table.
    pub fn read(&self) -> Vec<RouteEntry> {
        self.routes.lock().clone()
    }

    pub fn read_modem(&self, modem_id: &str) -> Vec<RouteEntry> {
        self.routes
            .lock()
            .iter()
            .filter(|r| r.modem_id == modem_id)
            .cloned()
            .collect()
    }

    /// Rows still eligible for routing decisions.
    pub fn read_selectable(&self) -> Vec<RouteEntry> {
        self.routes
            .lock()
            .iter()
            .filter(|r| r.obsolescence < SELECTABLE_BELOW)
            .cloned()
            .collect()
    }

    /// Overwrite the counter of one route.
    pub fn set_obsolete(&self, route_id: &str, value: u8) -> usize {
        let mut routes = self.routes.lock();
        let mut count = 0;
        for route in routes.iter_mut().filter(|r| r.route_id == route_id) {
            route.obsolescence = value;
            count += 1;
        }
        count
    }

    /// Withdraw one route (modem unregistration).
    pub fn withdraw_route(&self, route_id: &str) -> usize {
        self.withdraw_where(|r| r.route_id == route_id)
    }

    /// Withdraw every route owned by the WIS at `url` that is not already withdrawn.
    pub fn withdraw_owner_url(&self, url: &str) -> usize {
        self.withdraw_where(|r| r.owner_routing_url == url)
    }

    fn withdraw_where(&self, pred: impl Fn(&RouteEntry) -> bool) -> usize {
        let mut routes = self.routes.lock();
        let mut count = 0;
        for route in routes
            .iter_mut()
            .filter(|r| r.obsolescence < WITHDRAWN && pred(r))
        {
            route.obsolescence = Liveness::from_counter(route.obsolescence)
                .withdraw()
                .counter();
            count += 1;
        }
        count
    }

    /// Count one more message against every row of `modem_id`.
    pub fn increment_load(&self, modem_id: &str) -> usize {
        let mut routes = self.routes.lock();
        let mut count = 0;
        for route in routes.iter_mut().filter(|r| r.modem_id == modem_id) {
            route.load_count += 1;
            count += 1;
        }
        count
    }

    /// Advance every row by one protocol tick.
    pub fn age(&self, now: i64, stale_after: i64) -> usize {
        let mut routes = self.routes.lock();
        let mut changed = 0;
        for route in routes.iter_mut() {
            let stale = now - route.refreshed_at > stale_after;
            let next = Liveness::from_counter(route.obsolescence)
                .tick(stale)
                .counter();
            if next != route.obsolescence {
                route.obsolescence = next;
                changed += 1;
            }
        }
        changed
    }

    /// Delete rows that reached the terminal value.
    pub fn purge(&self) -> usize {
        let mut routes = self.routes.lock();
        let before = routes.len();
        routes.retain(|r| !Liveness::from_counter(r.obsolescence).is_terminal());
        before - routes.len()
    }

    /// Refresh a route. Withdrawn rows are left alone; returns the number of
    /// refreshed rows.
    pub fn heartbeat(&self, route_id: &str, now: i64) -> usize {
        let mut routes = self.routes.lock();
        let mut count = 0;
        for route in routes
            .iter_mut()
            .filter(|r| r.route_id == route_id && r.obsolescence < WITHDRAWN)
        {
            route.obsolescence = Liveness::from_counter(route.obsolescence)
                .refresh()
                .counter();
            route.refreshed_at = now;
            count += 1;
        }
        count
    }

    /// Merge a table received from a peer.
    pub fn merge(&self, incoming: Vec<RouteEntry>) -> MergeOutcome {
        let mut routes = self.routes.lock();
        let mut outcome = MergeOutcome::default();

        for route in incoming {
            if route.owner_node_id == self.node_id {
                outcome.skipped += 1;
                continue;
            }

            match routes.iter().find(|r| r.route_id == route.route_id) {
                Some(local) => {
                    if route.obsolescence == 0 && local.obsolescence < MERGEABLE_BELOW {
                        let changed_at = route.refreshed_at;
                        upsert_locked(&mut routes, route, changed_at);
                        outcome.updated += 1;
                    } else {
                        outcome.skipped += 1;
                    }
                }
                None => {
                    if route.obsolescence < WITHDRAWN {
                        let changed_at = route.refreshed_at;
                        upsert_locked(&mut routes, route, changed_at);
                        outcome.inserted += 1;
                    } else {
                        outcome.skipped += 1;
                    }
                }
            }
        }

        outcome
    }

    /// Distinct owner URLs of routes this node does not own.
    pub fn remote_owner_urls(&self) -> Vec<String> {
        let routes = self.routes.lock();
        let mut urls: Vec<String> = Vec::new();
        for route in routes.iter().filter(|r| r.owner_node_id != self.node_id) {
            if !urls.contains(&route.owner_routing_url) {
                urls.push(route.owner_routing_url.clone());
            }
        }
        urls
    }

    /// Distinct owner URLs of every row, this node's own included.
    pub fn owner_urls(&self) -> Vec<String> {
        let routes = self.routes.lock();
        let mut urls: Vec<String> = Vec::new();
        for route in routes.iter() {
            if !urls.contains(&route.owner_routing_url) {
                urls.push(route.owner_routing_url.clone());
            }
        }
        urls
    }
}

fn upsert_locked(routes: &mut Vec<RouteEntry>, mut route: RouteEntry, changed_at: i64) {
    route.refreshed_at = changed_at;

    if let Some(pos) = routes.iter().position(|r| r.route_id == route.route_id) {
        route.load_count = routes[pos].load_count;
        routes[pos] = route;
        return;
    }

    let prior_load = routes
        .iter()
        .find(|r| r.owner_node_id == route.owner_node_id && r.modem_id == route.modem_id)
        .map(|r| r.load_count);

    match prior_load {
        Some(load) => route.load_count = load,
        None => {
            reset_load_locked(routes);
            route.load_count = 0;
        }
    }
    routes.push(route);
}

fn reset_load_locked(routes: &mut [RouteEntry]) {
    for route in routes.iter_mut() {
        route.load_count = 0;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
