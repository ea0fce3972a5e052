//! Session wiring: signaling events drive the peer table, peer events drive
//! the catalog sync protocol, and a coalescing broadcast task ships local
//! change batches to every ready peer.
//!
//! The protocol on each channel: a peer whose channel opens sends
//! `sync-request{version}`; the other side answers `sync-response` with its
//! changes past that version; every local write later flows as incremental
//! `changes` batches. Applied batches re-stamp under the local version, so
//! changes keep propagating across the room transitively.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scrapyard_net::link::LinkFactory;
use scrapyard_net::{
    NetError, PeerEvent, PeerManager, SignalingClient, SignalingEvent,
};
use scrapyard_shared::constants::{BROADCAST_COALESCE_MS, TRANSFER_CHANNEL};
use scrapyard_shared::protocol::{PeerMessage, SignalingIn, SignalingOut, TransferMessage};
use scrapyard_shared::types::NodeId;
use scrapyard_store::{CrdtStore, FileStore};

use crate::error::{EngineError, Result};
use crate::events::CatalogEvent;
use crate::transfer::TransferEngine;

/// One connected room membership: signaling, peer table, transfer engine,
/// and the three pump tasks.
pub(crate) struct Session {
    pub signaling: Arc<SignalingClient>,
    pub peers: Arc<PeerManager>,
    pub transfer: Arc<TransferEngine>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub async fn establish(
        url: &str,
        token: &str,
        node_id: &NodeId,
        factory: Arc<dyn LinkFactory>,
        store: Arc<Mutex<CrdtStore>>,
        files: Arc<Mutex<FileStore>>,
        dirty: Arc<Notify>,
        events: mpsc::UnboundedSender<CatalogEvent>,
    ) -> Result<Session> {
        let local_id = node_id.to_hex();
        let (signaling, sig_rx) = SignalingClient::connect(url, token, &local_id)
            .await
            .map_err(|e| match e {
                NetError::TransportUnavailable(msg) => EngineError::TransportUnavailable(msg),
                other => EngineError::Net(other),
            })?;
        let signaling = Arc::new(signaling);

        let (peers, peer_rx) = PeerManager::new(local_id.clone(), factory);
        let transfer = Arc::new(TransferEngine::new(files, peers.clone(), events.clone()));

        let initial_version = store.lock().expect("store lock").version()?;
        let last_broadcast = Arc::new(AtomicI64::new(initial_version));

        let tasks = vec![
            tokio::spawn(signaling_loop(
                sig_rx,
                signaling.clone(),
                peers.clone(),
                transfer.clone(),
                events.clone(),
                local_id,
            )),
            tokio::spawn(peer_loop(
                peer_rx,
                store.clone(),
                peers.clone(),
                transfer.clone(),
                Some(signaling.clone()),
                events,
            )),
            tokio::spawn(broadcast_loop(store, peers.clone(), dirty, last_broadcast)),
        ];

        info!(url, "session established");
        Ok(Session {
            signaling,
            peers,
            transfer,
            tasks,
        })
    }

    pub async fn shutdown(self) {
        self.signaling.close();
        for task in &self.tasks {
            task.abort();
        }
        self.peers.shutdown().await;
        info!("session shut down");
    }
}

async fn signaling_loop(
    mut sig_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    signaling: Arc<SignalingClient>,
    peers: Arc<PeerManager>,
    transfer: Arc<TransferEngine>,
    events: mpsc::UnboundedSender<CatalogEvent>,
    local_id: String,
) {
    while let Some(event) = sig_rx.recv().await {
        match event {
            SignalingEvent::Message(msg) => {
                handle_signaling_message(&signaling, &peers, &transfer, &events, &local_id, msg)
                    .await;
            }
            SignalingEvent::Reconnecting { attempt } => {
                let _ = events.send(CatalogEvent::Reconnecting { attempt });
            }
            SignalingEvent::Reconnected => {
                let _ = events.send(CatalogEvent::Reconnected);
            }
            SignalingEvent::Disconnected => {
                let _ = events.send(CatalogEvent::Disconnected);
            }
        }
    }
}

async fn handle_signaling_message(
    signaling: &SignalingClient,
    peers: &Arc<PeerManager>,
    transfer: &TransferEngine,
    events: &mpsc::UnboundedSender<CatalogEvent>,
    local_id: &str,
    msg: SignalingIn,
) {
    match msg {
        // The joining node initiates toward everyone already in the room;
        // existing members wait for its offer.
        SignalingIn::Peers { peer_ids } => {
            for peer_id in peer_ids {
                if peer_id == local_id || peers.is_known(&peer_id) {
                    continue;
                }
                match peers.connect_to(&peer_id).await {
                    Ok(sdp) => {
                        if let Err(e) = signaling.send(SignalingOut::Offer { to: peer_id, sdp }) {
                            warn!(error = %e, "failed to relay offer");
                        }
                    }
                    Err(e) => warn!(peer = %peer_id, error = %e, "failed to initiate session"),
                }
            }
        }
        SignalingIn::PeerJoin { peer_id } => {
            debug!(peer = %peer_id, "peer joined, awaiting its offer");
        }
        SignalingIn::PeerLeave { peer_id } => {
            transfer.peer_gone(&peer_id);
            if peers.remove_peer(&peer_id).await {
                let _ = events.send(CatalogEvent::PeerLeave { peer_id });
            }
        }
        SignalingIn::Offer { from, sdp } => match peers.accept_offer(&from, &sdp).await {
            Ok(answer) => {
                if let Err(e) = signaling.send(SignalingOut::Answer {
                    to: from,
                    sdp: answer,
                }) {
                    warn!(error = %e, "failed to relay answer");
                }
            }
            Err(e) => warn!(peer = %from, error = %e, "failed to answer offer"),
        },
        SignalingIn::Answer { from, sdp } => {
            if let Err(e) = peers.accept_answer(&from, &sdp).await {
                warn!(peer = %from, error = %e, "failed to apply answer");
            }
        }
        SignalingIn::Ice { from, candidate } => {
            if let Err(e) = peers.add_candidate(&from, &candidate).await {
                debug!(peer = %from, error = %e, "dropping candidate");
            }
        }
    }
}

pub(crate) async fn peer_loop(
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    store: Arc<Mutex<CrdtStore>>,
    peers: Arc<PeerManager>,
    transfer: Arc<TransferEngine>,
    signaling: Option<Arc<SignalingClient>>,
    events: mpsc::UnboundedSender<CatalogEvent>,
) {
    while let Some(event) = peer_rx.recv().await {
        match event {
            PeerEvent::Ready { peer_id } => {
                let _ = events.send(CatalogEvent::PeerReady {
                    peer_id: peer_id.clone(),
                });
                let version = match store.lock().expect("store lock").version() {
                    Ok(version) => version,
                    Err(e) => {
                        warn!(error = %e, "version query failed, requesting full sync");
                        0
                    }
                };
                if let Err(e) = peers
                    .send_to(&peer_id, &PeerMessage::SyncRequest { version })
                    .await
                {
                    warn!(peer = %peer_id, error = %e, "initial sync request failed");
                }
            }
            PeerEvent::Candidate { peer_id, candidate } => {
                if let Some(signaling) = &signaling {
                    if let Err(e) = signaling.send(SignalingOut::Ice {
                        to: peer_id,
                        candidate,
                    }) {
                        warn!(error = %e, "failed to relay candidate");
                    }
                }
            }
            PeerEvent::Left { peer_id } => {
                transfer.peer_gone(&peer_id);
                let _ = events.send(CatalogEvent::PeerLeave { peer_id });
            }
            PeerEvent::Message { peer_id, message } => {
                handle_peer_message(&store, &peers, &transfer, &events, &peer_id, message).await;
            }
        }
    }
}

pub(crate) async fn handle_peer_message(
    store: &Arc<Mutex<CrdtStore>>,
    peers: &Arc<PeerManager>,
    transfer: &Arc<TransferEngine>,
    events: &mpsc::UnboundedSender<CatalogEvent>,
    peer_id: &str,
    message: PeerMessage,
) {
    match message {
        PeerMessage::SyncRequest { version } => {
            let response = {
                let store = store.lock().expect("store lock");
                match (store.changes_since(version), store.version()) {
                    (Ok(changes), Ok(version)) => Some(PeerMessage::SyncResponse { changes, version }),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "sync response query failed");
                        None
                    }
                }
            };
            if let Some(response) = response {
                if let Err(e) = peers.send_to(peer_id, &response).await {
                    warn!(peer = %peer_id, error = %e, "sync response send failed");
                }
            }
        }
        PeerMessage::SyncResponse { changes, version }
        | PeerMessage::Changes { changes, version } => {
            let count = changes.len();
            let applied = store.lock().expect("store lock").apply_changes(&changes);
            match applied {
                Ok(applied) => {
                    debug!(peer = %peer_id, count, applied, "folded change batch");
                    peers.set_last_synced(peer_id, version);
                    let _ = events.send(CatalogEvent::Sync {
                        count,
                        from_peer: peer_id.to_string(),
                    });
                }
                // last-synced stays put, so the batch is re-requested on the
                // next sync round.
                Err(e) => warn!(peer = %peer_id, error = %e, "rejected change batch"),
            }
        }
        PeerMessage::Ping => {
            if let Err(e) = peers.send_to(peer_id, &PeerMessage::Pong).await {
                debug!(peer = %peer_id, error = %e, "pong send failed");
            }
        }
        PeerMessage::Pong => {}
        PeerMessage::Custom { channel, data } => {
            if channel == TRANSFER_CHANNEL {
                match serde_json::from_value::<TransferMessage>(data) {
                    Ok(msg) => transfer.handle_message(peer_id, msg).await,
                    Err(e) => debug!(peer = %peer_id, error = %e, "bad transfer envelope"),
                }
            } else {
                debug!(peer = %peer_id, channel, "message on unknown custom channel");
            }
        }
    }
}

pub(crate) async fn broadcast_loop(
    store: Arc<Mutex<CrdtStore>>,
    peers: Arc<PeerManager>,
    dirty: Arc<Notify>,
    last_broadcast: Arc<AtomicI64>,
) {
    loop {
        dirty.notified().await;
        // Let a burst of writes land behind one batch.
        tokio::time::sleep(Duration::from_millis(BROADCAST_COALESCE_MS)).await;

        let since = last_broadcast.load(Ordering::SeqCst);
        let batch = {
            let store = store.lock().expect("store lock");
            match (store.changes_since(since), store.version()) {
                (Ok(changes), Ok(version)) => Some((changes, version)),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "broadcast query failed");
                    None
                }
            }
        };
        let Some((changes, version)) = batch else {
            continue;
        };
        if changes.is_empty() {
            continue;
        }

        debug!(count = changes.len(), version, "broadcasting changes");
        peers
            .broadcast(&PeerMessage::Changes { changes, version })
            .await;
        last_broadcast.store(version, Ordering::SeqCst);
    }
}
