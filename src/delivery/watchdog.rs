//! Event-driven delivery loop of a WIS.
//!
//! The watchdog sleeps until woken, sweeps expired messages, then drains
//! every NEW and DELEGATED-IN message: remote routes are delegated to their
//! owning WIS, local routes are dispatched to the attached dispatcher.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::assign::assign_route;
use super::store::MessageStore;
use crate::constants::obsolescence::SELECTABLE_BELOW;
use crate::error::{StorageError, TransportError};
use crate::routing::RouteStore;
use crate::transport::NodeClient;
use crate::types::{now_secs, Message, MessageStatus};

pub struct Watchdog {
    node_id: String,
    routes: Arc<RouteStore>,
    messages: Arc<dyn MessageStore>,
    client: NodeClient,
    retention_secs: i64,
    notify: Arc<Notify>,
}

impl Watchdog {
    pub fn new(
        node_id: impl Into<String>,
        routes: Arc<RouteStore>,
        messages: Arc<dyn MessageStore>,
        client: NodeClient,
        retention_secs: i64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            routes,
            messages,
            client,
            retention_secs,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request a sweep. Wakes issued while a sweep runs are kept for the next one.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::info!("🐕 Watchdog started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("🛑 Watchdog shutting down");
                    break;
                }
                _ = self.notify.notified() => {
                    match self.process().await {
                        Ok(0) => tracing::trace!("Watchdog: no messages to process"),
                        Ok(n) => tracing::debug!("🐕 Watchdog processed {} messages", n),
                        Err(e) => tracing::error!("❌ Watchdog sweep aborted: {}", e),
                    }
                }
            }
        }
    }

    /// One full sweep. Returns how many messages were handled; a message
    /// whose update fails is logged and skipped for the rest of the sweep.
    pub async fn process(&self) -> Result<usize, StorageError> {
        let cutoff = now_secs() - self.retention_secs;
        let expired = self.messages.delete_older_than(cutoff).await?;
        if expired > 0 {
            tracing::info!("🧹 Removed {} messages past retention", expired);
        }

        let mut handled = 0;
        // messages that could not be persisted stay queued for the next wake
        let mut failed: HashSet<String> = HashSet::new();
        loop {
            let queue: Vec<Message> = self
                .messages
                .queue()
                .await?
                .into_iter()
                .filter(|m| !failed.contains(&m.id))
                .collect();
            if queue.is_empty() {
                break;
            }
            for msg in queue {
                let id = msg.id.clone();
                match self.handle(msg).await {
                    Ok(()) => handled += 1,
                    Err(e) => {
                        tracing::error!("❌ Watchdog could not persist message {}: {}", id, e);
                        failed.insert(id);
                    }
                }
            }
        }
        Ok(handled)
    }

    async fn handle(&self, mut msg: Message) -> Result<(), StorageError> {
        if self.routes.is_empty() {
            msg.set_status(MessageStatus::NoRoute);
            tracing::debug!("Watchdog: no routes to process message {}", msg.id);
            return self.messages.update(&msg).await;
        }

        let route = self
            .routes
            .read_modem(&msg.modem_id)
            .into_iter()
            .find(|r| r.obsolescence < SELECTABLE_BELOW);

        let Some(route) = route else {
            tracing::warn!(
                "⚠️  Route lost for modem {:?} (message {}), re-routing",
                msg.modem_id,
                msg.id
            );
            msg.set_status(MessageStatus::RouteLost);
            self.messages.update(&msg).await?;
            if let Err(e) = assign_route(&self.routes, self.messages.as_ref(), &mut msg).await {
                tracing::debug!("Re-routing of {} failed: {}", msg.id, e);
            }
            return Ok(());
        };

        let previous = msg.status;
        if route.owner_node_id != self.node_id {
            let next = match self.client.delegate(&route.owner_routing_url, &msg).await {
                Ok(()) => MessageStatus::DelegateOk,
                Err(e) => {
                    tracing::warn!("⚠️  Delegation of {} failed: {}", msg.id, e);
                    MessageStatus::DelegateError
                }
            };
            msg.set_status(next);
        } else {
            let result = self.client.dispatch(&route.delivery_url, &msg).await;
            msg.set_status(dispatch_outcome(previous, &result));
            if let Err(e) = result {
                tracing::warn!("⚠️  Dispatch of {} failed: {}", msg.id, e);
            }
        }

        tracing::debug!(
            "🐕 Message {} {} -> {} via modem {}",
            msg.id,
            previous,
            msg.status,
            msg.modem_id
        );
        self.messages.update(&msg).await
    }
}

/// Status after a local dispatch attempt.
pub fn dispatch_outcome(previous: MessageStatus, result: &Result<(), TransportError>) -> MessageStatus {
    let direct = previous == MessageStatus::New;
    match result {
        Ok(()) if direct => MessageStatus::SentDirectOk,
        Ok(()) => MessageStatus::SentDelegatedOk,
        Err(TransportError::Status { .. }) if direct => MessageStatus::NoRoute,
        Err(_) if direct => MessageStatus::DirectTransportError,
        Err(_) => MessageStatus::SendError,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::delivery::store::InMemoryMessageStore;
    use crate::types::{RouteEntry, Submission};
    use std::time::Duration;

    fn client() -> NodeClient {
        NodeClient::new(
            Codec::new("k"),
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
        .unwrap()
    }

    fn route(route_id: &str, owner: &str, modem: &str, pattern: &str) -> RouteEntry {
        RouteEntry {
            route_id: route_id.to_string(),
            owner_node_id: owner.to_string(),
            modem_id: modem.to_string(),
            number_pattern: pattern.to_string(),
            load_count: 0,
            load_factor: 1,
            // closed loopback port: every call fails at the network level
            owner_routing_url: "http://127.0.0.1:9".to_string(),
            delivery_url: "http://127.0.0.1:9".to_string(),
            modem_label: modem.to_string(),
            obsolescence: 0,
            refreshed_at: now_secs(),
        }
    }

    fn queued(number: &str, modem: &str, status: MessageStatus) -> Message {
        let mut msg = Message::from_submission(
            Submission {
                target_number: number.to_string(),
                content: "hi".to_string(),
                ..Default::default()
            },
            None,
        );
        msg.modem_id = modem.to_string();
        msg.status = status;
        msg
    }

    fn watchdog(routes: Arc<RouteStore>, messages: Arc<dyn MessageStore>) -> Watchdog {
        Watchdog::new("wis1", routes, messages, client(), 86_400)
    }

    #[test]
    fn test_dispatch_outcome_table() {
        let refused: Result<(), TransportError> = Err(TransportError::Status {
            url: "u".to_string(),
            status: 500,
        });
        let codec_err: Result<(), TransportError> =
            Err(TransportError::Codec(crate::error::CodecError::Encrypt));

        use MessageStatus::*;
        assert_eq!(dispatch_outcome(New, &Ok(())), SentDirectOk);
        assert_eq!(dispatch_outcome(DelegatedIn, &Ok(())), SentDelegatedOk);
        assert_eq!(dispatch_outcome(New, &refused), NoRoute);
        assert_eq!(dispatch_outcome(DelegatedIn, &refused), SendError);
        assert_eq!(dispatch_outcome(New, &codec_err), DirectTransportError);
        assert_eq!(dispatch_outcome(DelegatedIn, &codec_err), SendError);
    }

    #[tokio::test]
    async fn test_empty_table_finalizes_as_no_route() {
        let routes = Arc::new(RouteStore::new("wis1"));
        let messages: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let msg = queued("+43", "m1", MessageStatus::New);
        messages.insert(&msg).await.unwrap();

        let dog = watchdog(routes, messages.clone());
        assert_eq!(dog.process().await.unwrap(), 1);
        let stored = messages.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::NoRoute);
    }

    #[tokio::test]
    async fn test_unreachable_dispatcher_and_owner() {
        let routes = Arc::new(RouteStore::new("wis1"));
        routes.upsert(route("local", "wis1", "m-local", "^\\+43"), None);
        routes.upsert(route("remote", "wis2", "m-remote", "^\\+49"), None);
        let messages: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());

        let direct = queued("+43", "m-local", MessageStatus::New);
        let delegated_in = queued("+43", "m-local", MessageStatus::DelegatedIn);
        let to_remote = queued("+49", "m-remote", MessageStatus::New);
        for m in [&direct, &delegated_in, &to_remote] {
            messages.insert(m).await.unwrap();
        }

        let dog = watchdog(routes, messages.clone());
        assert_eq!(dog.process().await.unwrap(), 3);

        let status = |id: String| {
            let messages = messages.clone();
            async move { messages.get(&id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(direct.id).await, MessageStatus::DirectTransportError);
        assert_eq!(status(delegated_in.id).await, MessageStatus::SendError);
        assert_eq!(status(to_remote.id).await, MessageStatus::DelegateError);
    }

    #[tokio::test]
    async fn test_lost_route_is_rerouted() {
        let routes = Arc::new(RouteStore::new("wis1"));
        routes.upsert(route("r1", "wis2", "m-new", "^\\+43"), None);
        let messages: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());

        let msg = queued("+43660", "m-vanished", MessageStatus::New);
        messages.insert(&msg).await.unwrap();

        let dog = watchdog(routes.clone(), messages.clone());
        // pass 1 re-routes to m-new, pass 2 tries to delegate it
        assert_eq!(dog.process().await.unwrap(), 2);

        let stored = messages.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.modem_id, "m-new");
        assert_eq!(stored.status, MessageStatus::DelegateError);
        assert_eq!(routes.read()[0].load_count, 1);
    }

    #[tokio::test]
    async fn test_withdrawn_route_counts_as_lost() {
        let routes = Arc::new(RouteStore::new("wis1"));
        routes.upsert(route("r1", "wis1", "m1", "^\\+43"), None);
        routes.set_obsolete("r1", 14);
        let messages: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());

        let msg = queued("+43660", "m1", MessageStatus::New);
        messages.insert(&msg).await.unwrap();

        let dog = watchdog(routes, messages.clone());
        assert_eq!(dog.process().await.unwrap(), 1);
        let stored = messages.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::NoRoute);
        assert_eq!(stored.modem_id, "NoPossibleRoutes");
    }

    /// Refuses updates of one message id.
    struct StuckStore {
        inner: InMemoryMessageStore,
        stuck_id: String,
    }

    #[async_trait::async_trait]
    impl MessageStore for StuckStore {
        async fn insert(&self, msg: &Message) -> Result<(), StorageError> {
            self.inner.insert(msg).await
        }
        async fn update(&self, msg: &Message) -> Result<(), StorageError> {
            if msg.id == self.stuck_id {
                return Err(StorageError::DatabaseOp("disk full".to_string()));
            }
            self.inner.update(msg).await
        }
        async fn get(&self, id: &str) -> Result<Option<Message>, StorageError> {
            self.inner.get(id).await
        }
        async fn list(&self) -> Result<Vec<Message>, StorageError> {
            self.inner.list().await
        }
        async fn remove(&self, id: &str) -> Result<(), StorageError> {
            self.inner.remove(id).await
        }
    }

    #[tokio::test]
    async fn test_failed_update_does_not_stall_the_queue() {
        let routes = Arc::new(RouteStore::new("wis1"));
        let mut stuck = queued("+43", "m1", MessageStatus::New);
        stuck.priority = 2;
        let after = queued("+43", "m1", MessageStatus::New);
        let store = StuckStore {
            inner: InMemoryMessageStore::new(),
            stuck_id: stuck.id.clone(),
        };
        store.insert(&stuck).await.unwrap();
        store.insert(&after).await.unwrap();
        let messages: Arc<dyn MessageStore> = Arc::new(store);

        let dog = watchdog(routes, messages.clone());
        // the stuck message is processed first and fails, the other still finishes
        assert_eq!(dog.process().await.unwrap(), 1);
        let stored = messages.get(&after.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::NoRoute);
        let left = messages.queue().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, stuck.id);
    }

    #[tokio::test]
    async fn test_wake_runs_a_sweep() {
        let routes = Arc::new(RouteStore::new("wis1"));
        let messages: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let msg = queued("+43", "m1", MessageStatus::New);
        messages.insert(&msg).await.unwrap();

        let dog = Arc::new(watchdog(routes, messages.clone()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(dog.clone().run(token.clone()));
        dog.wake();

        let mut finished = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if messages.queue().await.unwrap().is_empty() {
                finished = true;
                break;
            }
        }
        token.cancel();
        handle.await.unwrap();
        assert!(finished);
    }
}
