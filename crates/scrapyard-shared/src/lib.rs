pub mod constants;
pub mod protocol;
pub mod types;

pub use protocol::{
    ChangeRecord, FileEntry, PeerMessage, SignalingIn, SignalingOut, TransferMessage,
};
pub use types::{NodeId, SiteId};
