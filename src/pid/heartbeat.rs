use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::wire::{Outbound, SessionEnvelope};

/// Refresh every registered route once per `interval` over the session.
///
/// Stops on its own when the session writer is gone; it never forces a
/// reconnect itself.
pub async fn run_heartbeats(
    codec: Codec,
    route_ids: Vec<String>,
    interval: Duration,
    out: mpsc::UnboundedSender<Outbound>,
    token: CancellationToken,
) {
    tracing::debug!("💓 Heartbeats started for {} routes", route_ids.len());
    loop {
        for route_id in &route_ids {
            let envelope = SessionEnvelope::Heartbeat {
                route_id: route_id.clone(),
                code: None,
            };
            let frame = match codec.encode(&envelope) {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!("❌ Failed to encode heartbeat: {}", e);
                    return;
                }
            };
            if out.send(Outbound::Text(frame)).is_err() {
                tracing::debug!("💓 Heartbeat send failed, stopping heartbeats");
                return;
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_heartbeat_per_route_each_round() {
        let codec = Codec::new("k");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let task = tokio::spawn(run_heartbeats(
            codec.clone(),
            vec!["r1".to_string(), "r2".to_string()],
            Duration::from_secs(3600),
            tx,
            token.clone(),
        ));

        let mut seen = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Outbound::Text(frame) => match codec.decode(&frame).unwrap() {
                    SessionEnvelope::Heartbeat { route_id, code } => {
                        assert_eq!(code, None);
                        seen.push(route_id);
                    }
                    other => panic!("unexpected {:?}", other),
                },
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec!["r1", "r2"]);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_session_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        // returns instead of looping forever
        run_heartbeats(
            Codec::new("k"),
            vec!["r1".to_string()],
            Duration::from_secs(3600),
            tx,
            CancellationToken::new(),
        )
        .await;
    }
}
