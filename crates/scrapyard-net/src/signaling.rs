//! WebSocket signaling client.
//!
//! Speaks the small JSON room protocol (`join`, `offer`, `answer`, `ice` out;
//! roster and relayed session descriptions in) and owns the reconnect state
//! machine: exponential backoff capped at 30 s, at most 10 attempts, then
//! `Disconnected`. The socket runs in a background task; the handle only
//! pushes outgoing messages onto a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use scrapyard_shared::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_MS, RECONNECT_MAX_MS};
use scrapyard_shared::protocol::{SignalingIn, SignalingOut};

use crate::error::{NetError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events surfaced to the session layer.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// A protocol message relayed by the server.
    Message(SignalingIn),
    /// The socket dropped; a reconnect attempt is being scheduled.
    Reconnecting { attempt: u32 },
    /// A reconnect attempt succeeded and `join` was re-sent.
    Reconnected,
    /// Reconnect attempts are exhausted; the client is inert.
    Disconnected,
}

/// Handle to the signaling connection.
pub struct SignalingClient {
    peer_id: String,
    out_tx: mpsc::UnboundedSender<SignalingOut>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl SignalingClient {
    /// Establish the socket, issue `join`, and spawn the driver task.
    ///
    /// An initial connect failure is surfaced directly; failures of an
    /// established session feed the reconnect state machine instead.
    pub async fn connect(
        url: &str,
        token: &str,
        peer_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let endpoint = endpoint_url(url, token);
        let (ws, _) = connect_async(&endpoint)
            .await
            .map_err(|e| NetError::TransportUnavailable(e.to_string()))?;

        info!(url, peer = peer_id, "signaling connected");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_notify = Arc::new(Notify::new());

        tokio::spawn(drive(
            endpoint,
            peer_id.to_string(),
            ws,
            out_rx,
            events_tx,
            shutdown.clone(),
            shutdown_notify.clone(),
        ));

        Ok((
            Self {
                peer_id: peer_id.to_string(),
                out_tx,
                shutdown,
                shutdown_notify,
            },
            events_rx,
        ))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Queue a message for the server.
    pub fn send(&self, msg: SignalingOut) -> Result<()> {
        self.out_tx.send(msg).map_err(|_| NetError::Closed)
    }

    /// Drop the connection without reconnecting.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }
}

/// Backoff before reconnect attempt `attempt` (1-based):
/// `min(base * 2^(attempt-1), max)`.
pub fn reconnect_delay(attempt: u32) -> std::time::Duration {
    let exp = RECONNECT_BASE_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    std::time::Duration::from_millis(exp.min(RECONNECT_MAX_MS))
}

fn endpoint_url(url: &str, token: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}token={token}")
}

enum SocketDown {
    /// The handle was dropped or closed; do not reconnect.
    Local,
    /// The server side went away.
    Remote,
}

async fn drive(
    endpoint: String,
    peer_id: String,
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<SignalingOut>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
) {
    let mut ws = Some(ws);
    loop {
        let current_ws = ws.take().expect("socket present at top of loop");
        match run_socket(current_ws, &peer_id, &mut out_rx, &events_tx, &shutdown_notify).await {
            SocketDown::Local => return,
            SocketDown::Remote => {}
        }
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut reconnected = false;
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let _ = events_tx.send(SignalingEvent::Reconnecting { attempt });
            tokio::time::sleep(reconnect_delay(attempt)).await;
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match connect_async(&endpoint).await {
                Ok((new_ws, _)) => {
                    info!(attempt, "signaling reconnected");
                    ws = Some(new_ws);
                    let _ = events_tx.send(SignalingEvent::Reconnected);
                    reconnected = true;
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "signaling reconnect failed");
                }
            }
        }
        if !reconnected {
            warn!("signaling reconnect attempts exhausted");
            let _ = events_tx.send(SignalingEvent::Disconnected);
            return;
        }
    }
}

/// Pump one socket session until it drops. Re-joins the room on entry.
async fn run_socket(
    ws: WsStream,
    peer_id: &str,
    out_rx: &mut mpsc::UnboundedReceiver<SignalingOut>,
    events_tx: &mpsc::UnboundedSender<SignalingEvent>,
    shutdown_notify: &Notify,
) -> SocketDown {
    let (mut write, mut read) = ws.split();

    let join = SignalingOut::Join {
        peer_id: peer_id.to_string(),
    };
    let text = serde_json::to_string(&join).expect("signaling message serializes");
    if write.send(Message::Text(text)).await.is_err() {
        return SocketDown::Remote;
    }

    loop {
        tokio::select! {
            _ = shutdown_notify.notified() => {
                let _ = write.close().await;
                return SocketDown::Local;
            }
            outgoing = out_rx.recv() => {
                let Some(msg) = outgoing else {
                    // Handle dropped: close politely and stop.
                    let _ = write.close().await;
                    return SocketDown::Local;
                };
                let text = serde_json::to_string(&msg).expect("signaling message serializes");
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!(error = %e, "signaling send failed");
                    return SocketDown::Remote;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingIn>(&text) {
                            Ok(msg) => {
                                let _ = events_tx.send(SignalingEvent::Message(msg));
                            }
                            Err(e) => {
                                debug!(error = %e, "ignoring unparseable signaling message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SocketDown::Remote,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "signaling socket error");
                        return SocketDown::Remote;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(reconnect_delay(1).as_millis(), 1_000);
        assert_eq!(reconnect_delay(2).as_millis(), 2_000);
        assert_eq!(reconnect_delay(3).as_millis(), 4_000);
        assert_eq!(reconnect_delay(5).as_millis(), 16_000);
        assert_eq!(reconnect_delay(6).as_millis(), 30_000);
        assert_eq!(reconnect_delay(10).as_millis(), 30_000);
    }

    #[test]
    fn endpoint_carries_room_token() {
        assert_eq!(
            endpoint_url("wss://example.org/signal", "ROOM-A"),
            "wss://example.org/signal?token=ROOM-A"
        );
        assert_eq!(
            endpoint_url("wss://example.org/signal?v=2", "ROOM-A"),
            "wss://example.org/signal?v=2&token=ROOM-A"
        );
    }
}
