//! A submission node: owns the route table, the message store, the routing
//! protocol task and the watchdog task, and serves the WIS HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::api;
use crate::codec::Codec;
use crate::config::WisConfig;
use crate::delivery::{MessageStore, Watchdog};
use crate::error::AppError;
use crate::routing::{RouteStore, RoutingProtocol};
use crate::transport::NodeClient;
use crate::wire::RouterStatus;

#[derive(Default)]
struct NodeTasks {
    router: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

pub struct WisNode {
    node_id: String,
    public_url: String,
    routes: Arc<RouteStore>,
    messages: Arc<dyn MessageStore>,
    client: NodeClient,
    protocol: Arc<RoutingProtocol>,
    watchdog: Arc<Watchdog>,
    tasks: Mutex<NodeTasks>,
    token: CancellationToken,
}

impl WisNode {
    pub fn new(
        config: &WisConfig,
        retention_secs: i64,
        messages: Arc<dyn MessageStore>,
        codec: Codec,
        token: CancellationToken,
    ) -> Result<Arc<Self>, AppError> {
        let client = NodeClient::new(codec, config.http_timeout(), config.delivery_timeout())?;
        let routes = Arc::new(RouteStore::new(config.node_id.clone()));

        let protocol = Arc::new(RoutingProtocol::new(
            routes.clone(),
            client.clone(),
            config.public_url.clone(),
            config.peers.clone(),
            config.gossip_interval(),
            config.stale_after_secs,
            config.probe_every_ticks,
        ));
        let watchdog = Arc::new(Watchdog::new(
            config.node_id.clone(),
            routes.clone(),
            messages.clone(),
            client.clone(),
            retention_secs,
        ));

        Ok(Arc::new(Self {
            node_id: config.node_id.clone(),
            public_url: config.public_url.clone(),
            routes,
            messages,
            client,
            protocol,
            watchdog,
            tasks: Mutex::new(NodeTasks::default()),
            token,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn routes(&self) -> &Arc<RouteStore> {
        &self.routes
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    pub fn codec(&self) -> &Codec {
        self.client.codec()
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn protocol(&self) -> &Arc<RoutingProtocol> {
        &self.protocol
    }

    /// Start the router and watchdog tasks and run one initial sweep for
    /// messages left over from a previous run.
    pub fn start(&self) {
        self.ensure_running();
        self.watchdog.wake();
    }

    /// Respawn the router or watchdog task if it is not running.
    pub fn ensure_running(&self) {
        if self.token.is_cancelled() {
            return;
        }
        let mut tasks = self.tasks.lock();

        if !is_alive(&tasks.router) {
            if tasks.router.is_some() {
                tracing::warn!("⚠️  Router task was dead, restarting");
            }
            let protocol = self.protocol.clone();
            tasks.router = Some(tokio::spawn(protocol.run(self.token.clone())));
        }

        if !is_alive(&tasks.watchdog) {
            if tasks.watchdog.is_some() {
                tracing::warn!("⚠️  Watchdog task was dead, restarting");
            }
            let watchdog = self.watchdog.clone();
            tasks.watchdog = Some(tokio::spawn(watchdog.run(self.token.clone())));
        }
    }

    pub fn status(&self) -> RouterStatus {
        let tasks = self.tasks.lock();
        RouterStatus {
            router: liveness(&tasks.router).to_string(),
            watchdog: liveness(&tasks.watchdog).to_string(),
        }
    }

    /// Push the table to every peer right away, outside the regular cadence.
    pub fn broadcast_now(&self) {
        let protocol = self.protocol.clone();
        tokio::spawn(async move { protocol.broadcast().await });
    }

    /// Serve the HTTP API until the node's token is cancelled, then wait for
    /// the background tasks to stop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), AppError> {
        let addr = listener.local_addr()?;
        tracing::info!("🌐 WIS {} listening on {}", self.node_id, addr);

        let token = self.token.clone();
        let app = api::router(self.clone());
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

        let (router, watchdog) = {
            let mut tasks = self.tasks.lock();
            (tasks.router.take(), tasks.watchdog.take())
        };
        for handle in [router, watchdog].into_iter().flatten() {
            let _ = handle.await;
        }
        tracing::info!("🛑 WIS {} stopped", self.node_id);
        Ok(())
    }
}

fn is_alive(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

fn liveness(handle: &Option<JoinHandle<()>>) -> &'static str {
    if is_alive(handle) {
        "alive"
    } else {
        "dead"
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::InMemoryMessageStore;

    fn node(token: CancellationToken) -> Arc<WisNode> {
        let config = WisConfig {
            node_id: "wis1".to_string(),
            public_url: "http://127.0.0.1:1".to_string(),
            ..WisConfig::default()
        };
        WisNode::new(
            &config,
            86_400,
            Arc::new(InMemoryMessageStore::new()),
            Codec::new("k"),
            token,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_task_liveness() {
        let token = CancellationToken::new();
        let node = node(token.clone());
        assert_eq!(node.status().router, "dead");

        node.start();
        let status = node.status();
        assert_eq!(status.router, "alive");
        assert_eq!(status.watchdog, "alive");

        token.cancel();
        for _ in 0..50 {
            if node.status().watchdog == "dead" && node.status().router == "dead" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(node.status().watchdog, "dead");

        // a cancelled node never respawns its tasks
        node.ensure_running();
        assert_eq!(node.status().router, "dead");
    }
}
