//! Routing decision for a single message.

use regex::Regex;

use super::store::MessageStore;
use crate::constants::{obsolescence::SELECTABLE_BELOW, FALLBACK_PATTERN_PROBE};
use crate::error::{AppError, RoutingError};
use crate::routing::RouteStore;
use crate::types::{Message, MessageStatus, RouteEntry};

fn pattern_matches(route: &RouteEntry, subject: &str) -> bool {
    match Regex::new(&route.number_pattern) {
        Ok(re) => re.is_match(subject),
        Err(e) => {
            tracing::warn!(
                "⚠️  Route {} has invalid pattern {:?}: {}",
                route.route_id,
                route.number_pattern,
                e
            );
            false
        }
    }
}

/// Pick the route for `target` out of a table snapshot.
///
/// Candidates are selectable rows whose pattern matches the number, else
/// rows whose pattern matches the fallback probe. Among several candidates
/// the lowest `load_count / load_factor` wins; on equal ratios the candidate
/// evaluated last (latest in table order) wins.
pub fn select_route(routes: &[RouteEntry], target: &str) -> Result<RouteEntry, RoutingError> {
    if routes.is_empty() {
        return Err(RoutingError::NoRoutes);
    }

    let selectable: Vec<&RouteEntry> = routes
        .iter()
        .filter(|r| r.obsolescence < SELECTABLE_BELOW)
        .collect();

    let mut candidates: Vec<&RouteEntry> = selectable
        .iter()
        .copied()
        .filter(|r| pattern_matches(r, target))
        .collect();

    if candidates.is_empty() {
        candidates = selectable
            .iter()
            .copied()
            .filter(|r| pattern_matches(r, FALLBACK_PATTERN_PROBE))
            .collect();
    }

    if candidates.len() == 1 {
        return Ok(candidates[0].clone());
    }

    let mut best: Option<&RouteEntry> = None;
    let mut best_ratio = f64::INFINITY;
    for candidate in candidates {
        let ratio = candidate.load_ratio();
        if ratio <= best_ratio {
            best_ratio = ratio;
            best = Some(candidate);
        }
    }

    best.cloned().ok_or(RoutingError::NoPossibleRoutes)
}

/// Assign a modem to `msg` and persist it.
///
/// On success the message is stored with status NEW and the chosen modem's
/// load counter is bumped. On failure it is stored as NO-ROUTE with the
/// failure reason as its modem id.
pub async fn assign_route(
    routes: &RouteStore,
    messages: &dyn MessageStore,
    msg: &mut Message,
) -> Result<(), AppError> {
    match select_route(&routes.read(), &msg.target_number) {
        Ok(route) => {
            routes.increment_load(&route.modem_id);
            msg.modem_id = route.modem_id;
            msg.set_status(MessageStatus::New);
            messages.insert(msg).await?;
            tracing::debug!("📍 Message {} routed to modem {}", msg.id, msg.modem_id);
            Ok(())
        }
        Err(reason) => {
            msg.modem_id = reason.to_string();
            msg.set_status(MessageStatus::NoRoute);
            messages.insert(msg).await?;
            tracing::warn!(
                "⚠️  No route for message {} to {}: {}",
                msg.id,
                msg.target_number,
                reason
            );
            Err(AppError::Routing(reason))
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::store::InMemoryMessageStore;
    use crate::types::{now_secs, Submission};

    fn route(route_id: &str, modem: &str, pattern: &str, load: u64, factor: u32) -> RouteEntry {
        RouteEntry {
            route_id: route_id.to_string(),
            owner_node_id: "wis1".to_string(),
            modem_id: modem.to_string(),
            number_pattern: pattern.to_string(),
            load_count: load,
            load_factor: factor,
            owner_routing_url: "http://wis1".to_string(),
            delivery_url: "http://pis1".to_string(),
            modem_label: modem.to_string(),
            obsolescence: 0,
            refreshed_at: now_secs(),
        }
    }

    fn submission(number: &str) -> Message {
        Message::from_submission(
            Submission {
                target_number: number.to_string(),
                content: "hi".to_string(),
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn test_equal_ratio_picks_later_evaluated_route() {
        // Evaluation follows table order: "first" (10/2 = 5) then "second" (5/1 = 5).
        // A 4/1 row would not tie; it simply wins on ratio.
        let table = vec![
            route("r1", "first", "^\\+43", 10, 2),
            route("r2", "second", "^\\+43", 5, 1),
        ];
        assert_eq!(select_route(&table, "+43660").unwrap().modem_id, "second");

        let reversed = vec![table[1].clone(), table[0].clone()];
        assert_eq!(select_route(&reversed, "+43660").unwrap().modem_id, "first");
    }

    #[test]
    fn test_lowest_ratio_wins() {
        let table = vec![
            route("r1", "busy", "^\\+43", 9, 1),
            route("r2", "idle", "^\\+43", 9, 3),
            route("r3", "other", "^\\+49", 0, 1),
        ];
        assert_eq!(select_route(&table, "+43660").unwrap().modem_id, "idle");
    }

    #[test]
    fn test_fallback_and_withdrawn_rows() {
        let mut withdrawn = route("r1", "gone", "^\\+43", 0, 1);
        withdrawn.obsolescence = 14;
        let mut edge = route("r2", "edge", "^\\+43", 0, 1);
        edge.obsolescence = 13;
        let table = vec![withdrawn, edge, route("r3", "catchall", "fallback", 50, 1)];

        assert_eq!(select_route(&table, "+43660").unwrap().modem_id, "catchall");
        assert_eq!(select_route(&[], "+43"), Err(RoutingError::NoRoutes));
        assert_eq!(
            select_route(&table[..2], "+43660"),
            Err(RoutingError::NoPossibleRoutes)
        );
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let table = vec![route("r1", "broken", "(", 0, 1), route("r2", "ok", "^\\+", 0, 1)];
        assert_eq!(select_route(&table, "+1").unwrap().modem_id, "ok");
    }

    #[tokio::test]
    async fn test_unroutable_message_is_finalized() {
        let routes = RouteStore::new("wis1");
        routes.upsert(route("r1", "m1", "^\\+49", 0, 1), None);
        let messages = InMemoryMessageStore::new();

        let mut msg = submission("+43660");
        let err = assign_route(&routes, &messages, &mut msg).await.unwrap_err();
        assert!(matches!(err, AppError::Routing(RoutingError::NoPossibleRoutes)));

        let stored = messages.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::NoRoute);
        assert_eq!(stored.status.code(), 104);
        assert_eq!(stored.modem_id, "NoPossibleRoutes");
    }

    #[tokio::test]
    async fn test_assignment_bumps_load_for_every_row_of_the_modem() {
        let routes = RouteStore::new("wis1");
        routes.upsert(route("r1", "m1", "^\\+43", 0, 1), None);
        routes.upsert(route("r2", "m1", "fallback", 0, 1), None);
        let messages = InMemoryMessageStore::new();

        let mut msg = submission("0043660");
        assign_route(&routes, &messages, &mut msg).await.unwrap();
        assert_eq!(msg.modem_id, "m1");
        assert_eq!(msg.status, MessageStatus::New);
        assert!(routes.read().iter().all(|r| r.load_count == 1));
        assert!(messages.get(&msg.id).await.unwrap().is_some());
    }
}
