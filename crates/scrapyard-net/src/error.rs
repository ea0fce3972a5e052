use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Signaling transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("WebRTC error: {0}")]
    WebRtc(Box<webrtc::Error>),

    #[error("Peer '{0}' is not connected")]
    PeerNotConnected(String),

    #[error("Data channel is not open")]
    ChannelNotOpen,

    #[error("Data channel stayed congested past its deadline")]
    Congested,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Client is closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for NetError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        NetError::WebSocket(Box::new(e))
    }
}

impl From<webrtc::Error> for NetError {
    fn from(e: webrtc::Error) -> Self {
        NetError::WebRtc(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
