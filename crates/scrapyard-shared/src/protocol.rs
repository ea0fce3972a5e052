//! Wire envelopes for the three protocol surfaces: the JSON-over-WebSocket
//! signaling exchange, the per-peer data-channel protocol, and the
//! file-transfer sub-protocol multiplexed inside `custom` envelopes.
//!
//! Every envelope is a `{type, ...}` JSON object; the enums below carry the
//! discriminant in their serde tag so dispatch is a single `match`.

use serde::{Deserialize, Serialize};

/// Messages sent to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingOut {
    Join { peer_id: String },
    Offer { to: String, sdp: String },
    Answer { to: String, sdp: String },
    Ice { to: String, candidate: serde_json::Value },
}

/// Messages received from the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingIn {
    /// Current room roster, sent once after `join`.
    Peers { peer_ids: Vec<String> },
    PeerJoin { peer_id: String },
    PeerLeave { peer_id: String },
    Offer { from: String, sdp: String },
    Answer { from: String, sdp: String },
    Ice { from: String, candidate: serde_json::Value },
}

/// One replicated column write as it travels between peers.
///
/// `pk` and `site_id` are base64-encoded byte strings; `val` is a JSON
/// primitive or null. Consumers forward these without inspecting anything
/// but the version fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub table: String,
    pub pk: String,
    pub cid: String,
    pub val: serde_json::Value,
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: String,
    pub cl: i64,
    pub seq: i64,
}

/// Envelopes carried on the per-peer `ledger` data channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PeerMessage {
    SyncRequest {
        version: i64,
    },
    SyncResponse {
        changes: Vec<ChangeRecord>,
        version: i64,
    },
    Changes {
        changes: Vec<ChangeRecord>,
        version: i64,
    },
    Ping,
    Pong,
    /// Sub-protocol envelope; `channel` selects the consumer.
    Custom {
        channel: String,
        data: serde_json::Value,
    },
}

/// Metadata for one transferable file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub content_type: String,
}

/// File-transfer envelopes, nested inside `PeerMessage::Custom` with
/// `channel == "file-transfer"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TransferMessage {
    FileListRequest {
        site_id: String,
    },
    FileList {
        site_id: String,
        files: Vec<FileEntry>,
    },
    FileRequest {
        site_id: String,
        path: String,
    },
    FileStart {
        site_id: String,
        path: String,
        content_type: String,
        size: u64,
    },
    FileChunk {
        site_id: String,
        path: String,
        /// Base64-encoded bytes, decoded length at most 64 KiB.
        data: String,
    },
    FileEnd {
        site_id: String,
        path: String,
    },
}

impl TransferMessage {
    /// Wrap this message into the `custom` data-channel envelope.
    pub fn into_custom(self) -> PeerMessage {
        PeerMessage::Custom {
            channel: crate::constants::TRANSFER_CHANNEL.to_string(),
            data: serde_json::to_value(self).expect("transfer message serializes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signaling_join_shape() {
        let msg = SignalingOut::Join {
            peer_id: "abc123".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "join", "peerId": "abc123"})
        );
    }

    #[test]
    fn signaling_peers_parses() {
        let msg: SignalingIn =
            serde_json::from_value(json!({"type": "peers", "peerIds": ["a", "b"]})).unwrap();
        assert_eq!(
            msg,
            SignalingIn::Peers {
                peer_ids: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn signaling_peer_leave_shape() {
        let msg: SignalingIn =
            serde_json::from_value(json!({"type": "peer-leave", "peerId": "x"})).unwrap();
        assert_eq!(msg, SignalingIn::PeerLeave { peer_id: "x".into() });
    }

    #[test]
    fn peer_message_sync_request_shape() {
        let msg = PeerMessage::SyncRequest { version: 42 };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "sync-request", "version": 42})
        );
    }

    #[test]
    fn change_record_keys_are_snake_case() {
        let rec = ChangeRecord {
            table: "sites".into(),
            pk: "cGs=".into(),
            cid: "name".into(),
            val: json!("Alpha"),
            col_version: 1,
            db_version: 7,
            site_id: "c2l0ZQ==".into(),
            cl: 1,
            seq: 3,
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["col_version"], 1);
        assert_eq!(v["db_version"], 7);
        assert_eq!(v["site_id"], "c2l0ZQ==");
    }

    #[test]
    fn unknown_peer_message_type_is_an_error() {
        let res: Result<PeerMessage, _> =
            serde_json::from_value(json!({"type": "mystery", "x": 1}));
        assert!(res.is_err());
    }

    #[test]
    fn transfer_round_trips_through_custom_envelope() {
        let msg = TransferMessage::FileStart {
            site_id: "s".into(),
            path: "index.html".into(),
            content_type: "text/html".into(),
            size: 10,
        };
        let custom = msg.clone().into_custom();
        let PeerMessage::Custom { channel, data } = custom else {
            panic!("expected custom envelope");
        };
        assert_eq!(channel, "file-transfer");
        assert_eq!(data["type"], "file-start");
        assert_eq!(data["contentType"], "text/html");
        let back: TransferMessage = serde_json::from_value(data).unwrap();
        assert_eq!(back, msg);
    }
}
