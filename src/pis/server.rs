//! Dispatcher process: accepts modem-node sessions on `/ws`, registers their
//! modems upstream and bridges `POST /sendsms` onto those sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::registry::{DeliveryOutcome, SessionRegistry};
use super::upstream::WisLink;
use crate::codec::Codec;
use crate::config::PisConfig;
use crate::constants::close_code;
use crate::error::AppError;
use crate::transport::NodeClient;
use crate::types::{new_token, Message, ModemRegistration};
use crate::wire::{Outbound, SessionEnvelope};

pub struct Dispatcher {
    node_id: String,
    public_url: String,
    protocol_version: String,
    max_wait: Duration,
    codec: Codec,
    registry: SessionRegistry,
    upstream: WisLink,
    token: CancellationToken,
}

impl Dispatcher {
    pub fn new(config: &PisConfig, codec: Codec, token: CancellationToken) -> Result<Arc<Self>, AppError> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let client = NodeClient::new(codec.clone(), timeout, timeout)?;
        let upstream = WisLink::new(
            client,
            config.wis_urls.clone(),
            config.retry_wis_url,
            Duration::from_secs(config.retry_wait_secs),
        );

        Ok(Arc::new(Self {
            node_id: config.node_id.clone(),
            public_url: config.public_url.clone(),
            protocol_version: config.protocol_version.clone(),
            max_wait: Duration::from_secs(config.max_wait_secs),
            codec,
            registry: SessionRegistry::new(),
            upstream,
            token,
        }))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Serve sessions and submissions until cancelled, then withdraw the
    /// routes of every session still attached.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), AppError> {
        let addr = listener.local_addr()?;
        tracing::info!("🌐 PIS {} listening on {}", self.node_id, addr);

        let app = Router::new()
            .route("/ws", get(session_upgrade))
            .route("/sendsms", post(send_sms))
            .with_state(self.clone());

        let token = self.token.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

        let modems = self.registry.drain_all();
        if !modems.is_empty() {
            tracing::info!("📴 Unregistering {} modems before exit", modems.len());
            self.upstream.unregister(&modems).await;
        }
        tracing::info!("🛑 PIS {} stopped", self.node_id);
        Ok(())
    }

    /// Send `msg` on the session serving its modem and wait for the result.
    pub async fn dispatch(&self, msg: &Message) -> DeliveryOutcome {
        let envelope = SessionEnvelope::Sendsms { sms: msg.clone() };
        let token = match self.codec.encode(&envelope) {
            Ok(t) => t,
            Err(e) => return DeliveryOutcome::Error(e.to_string()),
        };
        self.registry
            .deliver(&msg.modem_id, &msg.id, token, self.max_wait)
            .await
    }

    fn send_envelope(&self, addr: &SocketAddr, envelope: &SessionEnvelope) {
        match self.codec.encode(envelope) {
            Ok(token) => {
                self.registry.send(addr, Outbound::Text(token));
            }
            Err(e) => tracing::error!("❌ Failed to encode session frame: {}", e),
        }
    }

    fn close_session(&self, addr: &SocketAddr, code: u16, reason: String) {
        tracing::warn!("⚠️  Closing session {} ({}): {}", addr, code, reason);
        self.registry.send(addr, Outbound::Close(code, reason));
    }

    async fn run_session(self: Arc<Self>, socket: WebSocket, addr: SocketAddr) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        self.registry.open(addr, tx);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let (message, closing) = match frame {
                    Outbound::Text(text) => (WsMessage::Text(text.into()), false),
                    Outbound::Close(code, reason) => (
                        WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.on_frame(addr, text.as_str()).await,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("Session {} read error: {}", addr, e);
                        break;
                    }
                }
            }
        }

        if let Some((node_id, modems)) = self.registry.close(&addr) {
            if !modems.is_empty() {
                tracing::info!(
                    "📴 Modem node {} disconnected, unregistering {} modems",
                    node_id,
                    modems.len()
                );
                self.upstream.unregister(&modems).await;
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    }

    async fn on_frame(self: &Arc<Self>, addr: SocketAddr, text: &str) {
        let envelope: SessionEnvelope = match self.codec.decode(text) {
            Ok(e) => e,
            Err(e) => {
                self.close_session(&addr, close_code::INTERNAL_ERROR, format!("Undecodable frame: {}", e));
                return;
            }
        };

        match envelope {
            SessionEnvelope::Register {
                node_id,
                modems,
                protocol,
                ..
            } => self.on_register(addr, node_id, modems, protocol).await,
            SessionEnvelope::Heartbeat { route_id, .. } => {
                let this = self.clone();
                tokio::spawn(async move {
                    let code = this.upstream.heartbeat(&route_id).await;
                    if code != 200 {
                        tracing::warn!("⚠️  Heartbeat for route {} answered {}", route_id, code);
                    }
                    this.send_envelope(
                        &addr,
                        &SessionEnvelope::Heartbeat {
                            route_id,
                            code: Some(code),
                        },
                    );
                });
            }
            SessionEnvelope::Status { message_id, status } => {
                tracing::debug!("📬 Message {} reported {}", message_id, status);
                self.registry.record_status(&addr, &message_id, &status);
            }
            SessionEnvelope::Sendsms { sms } => {
                tracing::warn!("⚠️  Unexpected sendsms for {} from session {}", sms.id, addr);
            }
        }
    }

    async fn on_register(
        &self,
        addr: SocketAddr,
        node_id: String,
        modems: Vec<ModemRegistration>,
        protocol: String,
    ) {
        if protocol != self.protocol_version {
            self.close_session(
                &addr,
                close_code::INTERNAL_ERROR,
                format!(
                    "PID protocol {} does not fit PIS protocol {}",
                    protocol, self.protocol_version
                ),
            );
            return;
        }

        let modems: Vec<ModemRegistration> = modems
            .into_iter()
            .map(|mut modem| {
                modem.route_id = new_token();
                modem.delivery_url = self.public_url.clone();
                modem
            })
            .collect();
        self.registry.register(addr, &node_id, modems.clone());

        if !self.upstream.register(&modems).await {
            self.close_session(
                &addr,
                close_code::INTERNAL_ERROR,
                "Unable to register to any WIS!".to_string(),
            );
            return;
        }

        tracing::info!(
            "✅ Modem node {} registered {} modems",
            node_id,
            modems.len()
        );
        self.send_envelope(
            &addr,
            &SessionEnvelope::Register {
                node_id: self.node_id.clone(),
                modems,
                protocol: self.protocol_version.clone(),
                status: Some("registered".to_string()),
            },
        );
    }
}

async fn session_upgrade(
    State(dispatcher): State<Arc<Dispatcher>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| dispatcher.run_session(socket, addr))
}

async fn send_sms(State(dispatcher): State<Arc<Dispatcher>>, body: String) -> Response {
    let msg: Message = match dispatcher.codec.decode(&body) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("⚠️  Rejected sendsms request: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let outcome = dispatcher.dispatch(&msg).await;
    match outcome {
        DeliveryOutcome::Success => {
            tracing::info!("📤 Message {} sent via modem {}", msg.id, msg.modem_id);
            StatusCode::OK.into_response()
        }
        other => {
            tracing::warn!(
                "⚠️  Message {} via modem {} failed: {:?}",
                msg.id,
                msg.modem_id,
                other
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
