//! Transport seam between the peer manager and the WebRTC stack.
//!
//! A [`PeerLink`] is one peer connection plus its single ordered reliable
//! data channel. The production implementation lives in [`crate::rtc`]; the
//! in-memory one in [`crate::mock`] lets higher layers run the full session
//! and sync machinery in tests without sockets.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Events a link pushes to its owner, tagged with the remote peer id.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A local ICE candidate to forward through signaling.
    IceCandidate(serde_json::Value),
    /// The data channel is open in both directions.
    Open,
    /// One inbound text frame.
    Message(String),
    /// The data channel closed.
    Closed,
    /// The underlying connection failed or disconnected.
    Failed,
}

/// One connection to a remote peer carrying the `ledger` channel.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the local session description (initiator side).
    async fn create_offer(&self) -> Result<String>;

    /// Take a remote offer and produce the answering description.
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    /// Take the remote answer to our offer.
    async fn accept_answer(&self, sdp: &str) -> Result<()>;

    /// Fold in a remote ICE candidate.
    async fn add_remote_candidate(&self, candidate: &serde_json::Value) -> Result<()>;

    /// Send one text frame over the data channel.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Tear the connection down.
    async fn close(&self);
}

/// Constructor for [`PeerLink`]s.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Create a link to `peer_id`. The initiator opens the data channel;
    /// the other side waits for the remote-announced one. Link events are
    /// delivered on `events` tagged with `peer_id`.
    async fn create_link(
        &self,
        peer_id: &str,
        initiator: bool,
        events: mpsc::UnboundedSender<(String, LinkEvent)>,
    ) -> Result<Arc<dyn PeerLink>>;
}
