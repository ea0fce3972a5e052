/// Notifications surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum CatalogEvent {
    /// A change batch from a peer was folded into the catalog.
    Sync { count: usize, from_peer: String },
    /// A peer's data channel is open and initial sync has been requested.
    PeerReady { peer_id: String },
    /// A peer left the room or its connection dropped.
    PeerLeave { peer_id: String },
    /// The signaling socket dropped; reconnect attempt scheduled.
    Reconnecting { attempt: u32 },
    /// Signaling reconnected and the room was re-joined.
    Reconnected,
    /// Signaling reconnects are exhausted; call `connect` again to resume.
    Disconnected,
    /// Bytes landed for an incoming file.
    TransferProgress {
        site_id: String,
        path: String,
        received: u64,
        total: u64,
    },
}
