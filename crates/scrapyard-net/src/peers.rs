//! Peer session table.
//!
//! One [`PeerLink`] per remote peer, created either because the roster named
//! the peer (we initiate) or because an offer arrived (they initiated).
//! Channel traffic is JSON [`PeerMessage`]s; frames that do not parse are
//! logged and dropped, never fatal. Broadcast walks ready peers in insertion
//! order and swallows per-peer send failures.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use scrapyard_shared::protocol::PeerMessage;

use crate::error::{NetError, Result};
use crate::link::{LinkEvent, LinkFactory, PeerLink};

/// Notifications from the session table to the engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The data channel to this peer is open.
    Ready { peer_id: String },
    /// The peer's channel closed or its connection failed.
    Left { peer_id: String },
    /// One parsed channel message.
    Message { peer_id: String, message: PeerMessage },
    /// A local ICE candidate that must be forwarded through signaling.
    Candidate {
        peer_id: String,
        candidate: serde_json::Value,
    },
}

struct PeerEntry {
    peer_id: String,
    link: Arc<dyn PeerLink>,
    ready: bool,
    last_synced_version: i64,
}

/// Session table plus the pump translating link events into [`PeerEvent`]s.
pub struct PeerManager {
    local_id: String,
    factory: Arc<dyn LinkFactory>,
    // Vec keeps broadcast in insertion order; the table stays small.
    peers: Mutex<Vec<PeerEntry>>,
    link_events_tx: mpsc::UnboundedSender<(String, LinkEvent)>,
}

impl PeerManager {
    /// Create the manager and its event stream.
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn LinkFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            local_id: local_id.into(),
            factory,
            peers: Mutex::new(Vec::new()),
            link_events_tx,
        });

        tokio::spawn(pump_link_events(
            Arc::downgrade(&manager),
            link_events_rx,
            events_tx,
        ));

        (manager, events_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Initiate a session to a peer named by the roster; returns the offer
    /// SDP to relay through signaling.
    pub async fn connect_to(&self, peer_id: &str) -> Result<String> {
        let link = self.install_link(peer_id, true).await?;
        let offer = link.create_offer().await?;
        info!(peer = peer_id, "created offer");
        Ok(offer)
    }

    /// Answer an incoming offer; returns the answer SDP to relay back.
    pub async fn accept_offer(&self, peer_id: &str, sdp: &str) -> Result<String> {
        let link = self.install_link(peer_id, false).await?;
        let answer = link.accept_offer(sdp).await?;
        info!(peer = peer_id, "answered offer");
        Ok(answer)
    }

    /// Fold in the answer to an offer we initiated.
    pub async fn accept_answer(&self, peer_id: &str, sdp: &str) -> Result<()> {
        let link = self
            .link_of(peer_id)
            .ok_or_else(|| NetError::PeerNotConnected(peer_id.to_string()))?;
        link.accept_answer(sdp).await
    }

    /// Fold in a relayed remote ICE candidate.
    pub async fn add_candidate(&self, peer_id: &str, candidate: &serde_json::Value) -> Result<()> {
        let link = self
            .link_of(peer_id)
            .ok_or_else(|| NetError::PeerNotConnected(peer_id.to_string()))?;
        link.add_remote_candidate(candidate).await
    }

    /// Tear a peer down (signaling leave, channel close, or failure).
    /// Idempotent; returns whether the peer was present.
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        let removed = {
            let mut peers = self.peers.lock().expect("peer table lock");
            let before = peers.len();
            let mut link = None;
            peers.retain(|entry| {
                if entry.peer_id == peer_id {
                    link = Some(entry.link.clone());
                    false
                } else {
                    true
                }
            });
            (peers.len() < before).then_some(link)
        };
        match removed {
            Some(Some(link)) => {
                link.close().await;
                info!(peer = peer_id, "peer removed");
                true
            }
            _ => false,
        }
    }

    pub fn is_known(&self, peer_id: &str) -> bool {
        self.peers
            .lock()
            .expect("peer table lock")
            .iter()
            .any(|e| e.peer_id == peer_id)
    }

    /// Ready peers in insertion order.
    pub fn ready_peers(&self) -> Vec<String> {
        self.peers
            .lock()
            .expect("peer table lock")
            .iter()
            .filter(|e| e.ready)
            .map(|e| e.peer_id.clone())
            .collect()
    }

    /// Highest local db version known to be pushed to this peer.
    pub fn last_synced(&self, peer_id: &str) -> Option<i64> {
        self.peers
            .lock()
            .expect("peer table lock")
            .iter()
            .find(|e| e.peer_id == peer_id)
            .map(|e| e.last_synced_version)
    }

    pub fn set_last_synced(&self, peer_id: &str, version: i64) {
        let mut peers = self.peers.lock().expect("peer table lock");
        if let Some(entry) = peers.iter_mut().find(|e| e.peer_id == peer_id) {
            entry.last_synced_version = version;
        }
    }

    /// Send one message to one peer.
    pub async fn send_to(&self, peer_id: &str, msg: &PeerMessage) -> Result<()> {
        let link = self
            .link_of(peer_id)
            .ok_or_else(|| NetError::PeerNotConnected(peer_id.to_string()))?;
        let text = serde_json::to_string(msg)?;
        link.send_text(&text).await
    }

    /// Send to every ready peer in insertion order. Per-peer failures are
    /// logged and swallowed; returns the number of successful sends.
    pub async fn broadcast(&self, msg: &PeerMessage) -> usize {
        let targets: Vec<(String, Arc<dyn PeerLink>)> = {
            let peers = self.peers.lock().expect("peer table lock");
            peers
                .iter()
                .filter(|e| e.ready)
                .map(|e| (e.peer_id.clone(), e.link.clone()))
                .collect()
        };
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "unserializable broadcast dropped");
                return 0;
            }
        };

        let mut sent = 0;
        for (peer_id, link) in targets {
            match link.send_text(&text).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer_id, error = %e, "broadcast send failed"),
            }
        }
        sent
    }

    fn link_of(&self, peer_id: &str) -> Option<Arc<dyn PeerLink>> {
        self.peers
            .lock()
            .expect("peer table lock")
            .iter()
            .find(|e| e.peer_id == peer_id)
            .map(|e| e.link.clone())
    }

    async fn install_link(&self, peer_id: &str, initiator: bool) -> Result<Arc<dyn PeerLink>> {
        let link = self
            .factory
            .create_link(peer_id, initiator, self.link_events_tx.clone())
            .await?;

        let stale = {
            let mut peers = self.peers.lock().expect("peer table lock");
            let stale = peers
                .iter()
                .position(|e| e.peer_id == peer_id)
                .map(|i| peers.remove(i).link);
            peers.push(PeerEntry {
                peer_id: peer_id.to_string(),
                link: link.clone(),
                ready: false,
                last_synced_version: 0,
            });
            stale
        };
        if let Some(stale) = stale {
            debug!(peer = peer_id, "replacing existing session");
            stale.close().await;
        }
        Ok(link)
    }

    /// Tear down every session (room leave / engine disconnect).
    pub async fn shutdown(&self) {
        let peer_ids: Vec<String> = {
            let peers = self.peers.lock().expect("peer table lock");
            peers.iter().map(|e| e.peer_id.clone()).collect()
        };
        for peer_id in peer_ids {
            self.remove_peer(&peer_id).await;
        }
    }

    fn mark_ready(&self, peer_id: &str) -> bool {
        let mut peers = self.peers.lock().expect("peer table lock");
        match peers.iter_mut().find(|e| e.peer_id == peer_id) {
            Some(entry) => {
                entry.ready = true;
                true
            }
            None => false,
        }
    }
}

async fn pump_link_events(
    manager: Weak<PeerManager>,
    mut link_events_rx: mpsc::UnboundedReceiver<(String, LinkEvent)>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
) {
    while let Some((peer_id, event)) = link_events_rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            LinkEvent::Open => {
                if manager.mark_ready(&peer_id) {
                    info!(peer = %peer_id, "data channel open");
                    let _ = events_tx.send(PeerEvent::Ready { peer_id });
                }
            }
            LinkEvent::Message(text) => match serde_json::from_str::<PeerMessage>(&text) {
                Ok(message) => {
                    let _ = events_tx.send(PeerEvent::Message { peer_id, message });
                }
                Err(e) => {
                    debug!(peer = %peer_id, error = %e, "ignoring unknown channel message");
                }
            },
            LinkEvent::IceCandidate(candidate) => {
                let _ = events_tx.send(PeerEvent::Candidate { peer_id, candidate });
            }
            LinkEvent::Closed | LinkEvent::Failed => {
                if manager.remove_peer(&peer_id).await {
                    let _ = events_tx.send(PeerEvent::Left { peer_id });
                }
            }
        }
    }
}
