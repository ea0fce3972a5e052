use std::path::PathBuf;

use scrapyard_shared::constants::{default_db_name, DEFAULT_ICE_SERVERS};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the embedded catalog database (`scrap_yard_v{N}`).
    pub db_name: String,
    /// WebSocket signaling endpoint, e.g. `wss://host/signal`.
    pub signaling_url: Option<String>,
    /// Room token appended to the signaling URL. Any printable string.
    pub token: Option<String>,
    /// ICE servers for peer connections.
    pub ice_servers: Vec<String>,
    /// Override the platform data directory (used by tests).
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_name: default_db_name(),
            signaling_url: None,
            token: None,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SCRAPYARD_SIGNALING_URL") {
            config.signaling_url = Some(url);
        }

        if let Ok(token) = std::env::var("SCRAPYARD_TOKEN") {
            config.token = Some(token);
        }

        if let Ok(servers) = std::env::var("SCRAPYARD_ICE_SERVERS") {
            let parsed: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                config.ice_servers = parsed;
            }
        }

        config
    }
}
