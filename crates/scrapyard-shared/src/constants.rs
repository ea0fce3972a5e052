/// Label of the single ordered reliable data channel carried per peer.
pub const DATA_CHANNEL_LABEL: &str = "ledger";

/// Sub-channel tag under which file-transfer envelopes travel.
pub const TRANSFER_CHANNEL: &str = "file-transfer";

/// Maximum decoded payload of a single `file-chunk` (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Cooperative yield between outgoing chunks, in milliseconds.
pub const CHUNK_YIELD_MS: u64 = 10;

/// Deadline for a `file-list` answer.
pub const FILE_LIST_TIMEOUT_SECS: u64 = 30;

/// Deadline for a single file to complete streaming.
pub const FILE_TIMEOUT_SECS: u64 = 60;

/// Signaling reconnect backoff base delay in milliseconds.
pub const RECONNECT_BASE_MS: u64 = 1_000;

/// Signaling reconnect backoff cap in milliseconds (30 s).
pub const RECONNECT_MAX_MS: u64 = 30_000;

/// Signaling reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Coalescing window for catalog change broadcasts, in milliseconds.
pub const BROADCAST_COALESCE_MS: u64 = 20;

/// Catalog schema version; part of the on-disk database name.
pub const SCHEMA_VERSION: u32 = 1;

/// The single CRDT-enabled catalog table.
pub const SITES_TABLE: &str = "sites";

/// Column-id sentinel marking a row tombstone in a change record.
pub const DELETE_SENTINEL: &str = "-1";

/// Default STUN servers used when the caller supplies none.
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Name of the embedded catalog database for the current schema version.
pub fn default_db_name() -> String {
    format!("scrap_yard_v{SCHEMA_VERSION}")
}
