//! Modem-node side of the dispatcher session.
//!
//! A session registers the node's modems, keeps their routes alive with
//! heartbeats and sends whatever the dispatcher pushes. Sessions are retried
//! over the ordered dispatcher list; a session on a backup dispatcher is
//! dropped on purpose once the primary answers again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::failover::FailoverCursor;
use super::heartbeat::run_heartbeats;
use super::modem::ModemBank;
use crate::codec::Codec;
use crate::config::PidConfig;
use crate::constants::{close_code, defaults};
use crate::error::AppError;
use crate::types::{now_secs, Message};
use crate::wire::{Outbound, SessionEnvelope};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Nothing to offer the dispatcher; stop reconnecting.
    Fatal,
    /// The primary dispatcher is back; reconnect to it right away.
    PrimaryRecovered,
    /// Connection failed or was closed; back off and retry.
    Dropped,
    /// Local shutdown.
    Shutdown,
}

pub struct ModemNodeClient {
    node_id: String,
    protocol_version: String,
    pis_urls: Vec<String>,
    retry: u32,
    retry_wait: Duration,
    heartbeat_interval: Duration,
    primary_check_secs: i64,
    codec: Codec,
    bank: Arc<ModemBank>,
    http: reqwest::Client,
}

impl ModemNodeClient {
    pub fn new(config: &PidConfig, codec: Codec, bank: Arc<ModemBank>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(defaults::HTTP_TIMEOUT_SECS))
            .build()
            .map_err(crate::error::TransportError::Client)?;

        Ok(Self {
            node_id: config.node_id.clone(),
            protocol_version: config.protocol_version.clone(),
            pis_urls: config.pis_urls.clone(),
            retry: config.retry_pis_url,
            retry_wait: Duration::from_secs(config.retry_wait_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            primary_check_secs: config.primary_check_secs,
            codec,
            bank,
            http,
        })
    }

    /// Reconnect loop. Returns on a fatal session end or on shutdown.
    pub async fn run(&self, token: CancellationToken) {
        let mut cursor = FailoverCursor::new(self.pis_urls.clone(), self.retry);

        loop {
            let url = cursor.current().to_string();
            let primary = cursor.primary().to_string();
            let on_primary = cursor.is_primary();

            match self.run_session(&url, on_primary, &primary, &token).await {
                SessionEnd::Fatal => {
                    tracing::error!("❌ No usable modem, modem node stops reconnecting");
                    break;
                }
                SessionEnd::Shutdown => break,
                SessionEnd::PrimaryRecovered => {
                    tracing::info!("🔁 Primary PIS {} is back, reconnecting", primary);
                    cursor.on_primary_recovered();
                }
                SessionEnd::Dropped => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_wait) => {}
                    }
                    cursor.on_failure();
                }
            }
        }
        tracing::info!("🛑 Modem node {} session loop finished", self.node_id);
    }

    /// One session against `url`, from connect to close.
    pub async fn run_session(
        &self,
        url: &str,
        on_primary: bool,
        primary: &str,
        token: &CancellationToken,
    ) -> SessionEnd {
        let ws_url = format!("{}/ws", url.trim_end_matches('/'));
        tracing::info!("🔌 Connecting to PIS {}", ws_url);

        let connect = tokio::time::timeout(
            Duration::from_secs(defaults::HTTP_TIMEOUT_SECS),
            tokio_tungstenite::connect_async(ws_url.as_str()),
        );
        let stream = match connect.await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                tracing::warn!("⚠️  Connection to {} failed: {}", ws_url, e);
                return SessionEnd::Dropped;
            }
            Err(_) => {
                tracing::warn!("⚠️  Connection to {} timed out", ws_url);
                return SessionEnd::Dropped;
            }
        };

        let (mut sink, mut stream) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let (message, closing) = match frame {
                    Outbound::Text(text) => (WsMessage::Text(text.into()), false),
                    Outbound::Close(code, reason) => (
                        WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
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

        let session_token = token.child_token();
        let end = self
            .drive_session(&tx, &mut stream, on_primary, primary, token, &session_token)
            .await;

        session_token.cancel();
        drop(tx);
        let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
        tracing::info!("🔌 Session with {} ended: {:?}", url, end);
        end
    }

    async fn drive_session<S>(
        &self,
        tx: &mpsc::UnboundedSender<Outbound>,
        stream: &mut S,
        on_primary: bool,
        primary: &str,
        token: &CancellationToken,
        session_token: &CancellationToken,
    ) -> SessionEnd
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let modems = self.bank.registrations();
        if modems.is_empty() {
            let _ = tx.send(Outbound::Close(close_code::FATAL, "No usable modem".to_string()));
            return SessionEnd::Fatal;
        }

        let register = SessionEnvelope::Register {
            node_id: self.node_id.clone(),
            modems,
            protocol: self.protocol_version.clone(),
            status: None,
        };
        if !self.send_envelope(tx, &register) {
            return SessionEnd::Dropped;
        }

        let mut heartbeat: Option<JoinHandle<()>> = None;
        let mut last_primary_check = now_secs();
        // sends run in their own tasks and report back here when done
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<bool>();

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => {
                    let _ = tx.send(Outbound::Close(1000, "Modem node shutting down".to_string()));
                    return SessionEnd::Shutdown;
                }
                Some(reported) = done_rx.recv() => {
                    if !reported {
                        return SessionEnd::Dropped;
                    }
                    if !on_primary && now_secs() - last_primary_check >= self.primary_check_secs {
                        last_primary_check = now_secs();
                        if self.primary_is_back(primary).await {
                            // let the dispatcher collect the status first
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            let _ = tx.send(Outbound::Close(
                                close_code::PRIMARY_RECOVERED,
                                "Primary PIS is back".to_string(),
                            ));
                            return SessionEnd::PrimaryRecovered;
                        }
                    }
                    continue;
                }
                frame = stream.next() => frame,
            };

            let text = match frame {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Close(close))) => {
                    let code = close.map(|c| u16::from(c.code));
                    tracing::warn!("⚠️  PIS closed the session (code {:?})", code);
                    return if code == Some(close_code::FATAL) {
                        SessionEnd::Fatal
                    } else {
                        SessionEnd::Dropped
                    };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!("⚠️  Session error: {}", e);
                    return SessionEnd::Dropped;
                }
                None => return SessionEnd::Dropped,
            };

            let envelope: SessionEnvelope = match self.codec.decode(text.as_str()) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("⚠️  Ignoring undecodable frame: {}", e);
                    continue;
                }
            };

            match envelope {
                SessionEnvelope::Register { status, modems, .. } => {
                    if status.as_deref() != Some("registered") {
                        continue;
                    }
                    tracing::info!("✅ Registered {} modems", modems.len());
                    if let Some(previous) = heartbeat.take() {
                        previous.abort();
                    }
                    let route_ids = modems.into_iter().map(|m| m.route_id).collect();
                    heartbeat = Some(tokio::spawn(run_heartbeats(
                        self.codec.clone(),
                        route_ids,
                        self.heartbeat_interval,
                        tx.clone(),
                        session_token.clone(),
                    )));
                }
                SessionEnvelope::Sendsms { sms } => {
                    tokio::spawn(send_sms(
                        self.bank.clone(),
                        self.codec.clone(),
                        tx.clone(),
                        done_tx.clone(),
                        sms,
                    ));
                }
                SessionEnvelope::Heartbeat { route_id, code } => {
                    if let Some(code) = code.filter(|c| *c != 200) {
                        tracing::warn!(
                            "⚠️  Heartbeat for route {} rejected upstream ({}), reconnecting",
                            route_id,
                            code
                        );
                        let _ = tx.send(Outbound::Close(1000, "Heartbeat rejected".to_string()));
                        return SessionEnd::Dropped;
                    }
                }
                SessionEnvelope::Status { .. } => {}
            }
        }
    }

    fn send_envelope(&self, tx: &mpsc::UnboundedSender<Outbound>, envelope: &SessionEnvelope) -> bool {
        match self.codec.encode(envelope) {
            Ok(frame) => tx.send(Outbound::Text(frame)).is_ok(),
            Err(e) => {
                tracing::error!("❌ Failed to encode session frame: {}", e);
                false
            }
        }
    }

    /// The primary dispatcher answers its root with 404 when it is up.
    async fn primary_is_back(&self, primary: &str) -> bool {
        let url = http_url(primary);
        match self.http.get(&url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::NOT_FOUND,
            Err(e) => {
                tracing::debug!("Primary PIS {} not back: {}", url, e);
                false
            }
        }
    }
}

/// Send one message on its modem and report the result over the session.
/// `done` receives whether the status frame could be queued.
async fn send_sms(
    bank: Arc<ModemBank>,
    codec: Codec,
    tx: mpsc::UnboundedSender<Outbound>,
    done: mpsc::UnboundedSender<bool>,
    sms: Message,
) {
    tracing::info!("📤 Sending {} to {} via {}", sms.id, sms.target_number, sms.modem_id);
    let status = bank.send(&sms).await;
    let envelope = SessionEnvelope::Status {
        message_id: sms.id,
        status: status.to_string(),
    };
    let reported = match codec.encode(&envelope) {
        Ok(frame) => tx.send(Outbound::Text(frame)).is_ok(),
        Err(e) => {
            tracing::error!("❌ Failed to encode session frame: {}", e);
            false
        }
    };
    let _ = done.send(reported);
}

/// `ws://host:port` to `http://host:port`.
pub fn http_url(ws_url: &str) -> String {
    if let Some(rest) = ws_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = ws_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        ws_url.to_string()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_url() {
        assert_eq!(http_url("ws://10.0.0.1:7788"), "http://10.0.0.1:7788");
        assert_eq!(http_url("wss://pis.example"), "https://pis.example");
        assert_eq!(http_url("http://already"), "http://already");
    }

    #[tokio::test]
    async fn test_unreachable_dispatcher_drops_session() {
        let config = PidConfig {
            node_id: "pid1".to_string(),
            pis_urls: vec!["ws://127.0.0.1:9".to_string()],
            ..PidConfig::default()
        };
        let client =
            ModemNodeClient::new(&config, Codec::new("k"), Arc::new(ModemBank::default())).unwrap();
        let end = client
            .run_session("ws://127.0.0.1:9", true, "ws://127.0.0.1:9", &CancellationToken::new())
            .await;
        assert_eq!(end, SessionEnd::Dropped);
    }
}
