// Session layer: reconnecting WebSocket signaling plus one WebRTC data
// channel per remote peer, behind a mockable link seam.

pub mod link;
pub mod mock;
pub mod peers;
pub mod rtc;
pub mod signaling;

mod error;

pub use error::{NetError, Result};
pub use link::{LinkEvent, LinkFactory, PeerLink};
pub use peers::{PeerEvent, PeerManager};
pub use rtc::RtcFactory;
pub use signaling::{SignalingClient, SignalingEvent};
