use thiserror::Error;

use scrapyard_net::NetError;
use scrapyard_store::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Missing configuration: {0}")]
    ConfigurationMissing(&'static str),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Peer '{0}' went away")]
    PeerGone(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Not found")]
    NotFound,

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Network failure: {0}")]
    Net(#[from] NetError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
