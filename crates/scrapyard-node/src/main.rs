//! Headless scrapyard node: opens the catalog, joins the configured room,
//! and serves cached sites over the local HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scrapyard_engine::{CatalogEvent, EngineConfig, ScrapYard};
use scrapyard_http::{build_router, HttpState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,scrapyard_engine=debug")),
        )
        .init();

    info!("Starting scrapyard node v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();
    let yard = Arc::new(ScrapYard::new(config.clone()));
    yard.init().await?;
    info!(node = %yard.node_id()?, db = %config.db_name, "catalog open");

    if let Ok(Some(mut events)) = yard.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CatalogEvent::Sync { count, from_peer } => {
                        info!(peer = %from_peer, count, "catalog synced")
                    }
                    CatalogEvent::PeerReady { peer_id } => info!(peer = %peer_id, "peer ready"),
                    CatalogEvent::PeerLeave { peer_id } => info!(peer = %peer_id, "peer left"),
                    CatalogEvent::Reconnecting { attempt } => {
                        warn!(attempt, "signaling reconnecting")
                    }
                    CatalogEvent::Reconnected => info!("signaling reconnected"),
                    CatalogEvent::Disconnected => warn!("signaling gone, sync paused"),
                    CatalogEvent::TransferProgress {
                        site_id,
                        path,
                        received,
                        total,
                    } => info!(site = %site_id, path = %path, received, total, "transfer"),
                }
            }
        });
    }

    if config.signaling_url.is_some() && config.token.is_some() {
        yard.connect().await?;
        info!("joined room, catalog syncing");
    } else {
        info!("no signaling configured, running offline");
    }

    let http_addr: SocketAddr = std::env::var("SCRAPYARD_HTTP_ADDR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| ([127, 0, 0, 1], 8787).into());

    let router = build_router(HttpState {
        files: yard.file_store()?,
    });
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!(addr = %http_addr, "serving cached sites under /local/{{siteId}}/");
    axum::serve(listener, router).await?;

    Ok(())
}
