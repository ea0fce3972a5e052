//! Catalog engine: the replicated site catalog plus peer file transfer.
//!
//! A [`ScrapYard`] owns the CRDT store, the local blob store, and (once
//! connected) the signaling session and peer table. Catalog metadata
//! converges automatically across the room; file content moves only through
//! explicit [`ScrapYard::import_site`] calls.

pub mod catalog;
pub mod config;
pub mod events;
pub mod transfer;

mod error;
mod sync;

use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{mpsc, Notify};
use tracing::info;

use scrapyard_net::link::LinkFactory;
use scrapyard_net::RtcFactory;
use scrapyard_shared::constants::SITES_TABLE;
use scrapyard_shared::types::NodeId;
use scrapyard_store::{CrdtStore, FileStore};

pub use catalog::{AdoptOutcome, NewSite};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::CatalogEvent;
pub use scrapyard_store::{Site, SitePatch, StoredFile};
pub use transfer::{PeerSender, TransferEngine};

/// Shared handle to the local blob store.
pub type SharedFileStore = Arc<Mutex<FileStore>>;

pub(crate) struct Inner {
    store: Arc<Mutex<CrdtStore>>,
    files: SharedFileStore,
    node_id: NodeId,
    dirty: Arc<Notify>,
    events_tx: mpsc::UnboundedSender<CatalogEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CatalogEvent>>>,
    session: tokio::sync::Mutex<Option<sync::Session>>,
}

/// The engine context. Construct, [`init`](Self::init), then use the catalog
/// API; [`connect`](Self::connect) joins the room and starts syncing.
pub struct ScrapYard {
    config: EngineConfig,
    inner: OnceLock<Arc<Inner>>,
}

impl ScrapYard {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inner: OnceLock::new(),
        }
    }

    /// Open the catalog and blob stores and start CRDT tracking. Idempotent.
    pub async fn init(&self) -> Result<()> {
        if self.inner.get().is_some() {
            return Ok(());
        }

        let (mut store, files) = match &self.config.data_dir {
            Some(dir) => (
                CrdtStore::open_at(&dir.join(format!("{}.db", self.config.db_name)))?,
                FileStore::open_at(&dir.join(format!("{}_files.db", self.config.db_name)))?,
            ),
            None => (
                CrdtStore::open(&self.config.db_name)?,
                FileStore::new(&self.config.db_name)?,
            ),
        };
        store.enable_crdt(SITES_TABLE)?;
        let node_id = store.node_id().clone();

        let dirty = Arc::new(Notify::new());
        {
            let dirty = dirty.clone();
            store.subscribe(move |_, _| dirty.notify_one());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(node = %node_id.short(), db = %self.config.db_name, "engine initialized");

        let _ = self.inner.set(Arc::new(Inner {
            store: Arc::new(Mutex::new(store)),
            files: Arc::new(Mutex::new(files)),
            node_id,
            dirty,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            session: tokio::sync::Mutex::new(None),
        }));
        Ok(())
    }

    pub(crate) fn inner(&self) -> Result<&Arc<Inner>> {
        self.inner.get().ok_or(EngineError::NotInitialized)
    }

    pub(crate) fn store(&self) -> Result<Arc<Mutex<CrdtStore>>> {
        Ok(self.inner()?.store.clone())
    }

    /// This replica's stable hex identifier.
    pub fn node_id(&self) -> Result<String> {
        Ok(self.inner()?.node_id.to_hex())
    }

    /// Take the engine event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Result<Option<mpsc::UnboundedReceiver<CatalogEvent>>> {
        Ok(self.inner()?.events_rx.lock().expect("events lock").take())
    }

    /// Join the configured room over WebRTC and start catalog sync.
    pub async fn connect(&self) -> Result<()> {
        let url = self
            .config
            .signaling_url
            .clone()
            .ok_or(EngineError::ConfigurationMissing("signaling_url"))?;
        let token = self
            .config
            .token
            .clone()
            .ok_or(EngineError::ConfigurationMissing("token"))?;
        let factory = Arc::new(RtcFactory::new(self.config.ice_servers.clone())?);
        self.connect_with(&url, &token, factory).await
    }

    /// Join a room over a caller-supplied link transport.
    pub async fn connect_with(
        &self,
        url: &str,
        token: &str,
        factory: Arc<dyn LinkFactory>,
    ) -> Result<()> {
        let inner = self.inner()?;
        let mut slot = inner.session.lock().await;
        if let Some(old) = slot.take() {
            old.shutdown().await;
        }
        let session = sync::Session::establish(
            url,
            token,
            &inner.node_id,
            factory,
            inner.store.clone(),
            inner.files.clone(),
            inner.dirty.clone(),
            inner.events_tx.clone(),
        )
        .await?;
        *slot = Some(session);
        Ok(())
    }

    /// Leave the room and stop syncing. The catalog stays usable offline.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = self.inner()?;
        if let Some(session) = inner.session.lock().await.take() {
            session.shutdown().await;
        }
        Ok(())
    }

    /// Peers with an open data channel right now.
    pub async fn connected_peers(&self) -> Result<Vec<String>> {
        let inner = self.inner()?;
        let slot = inner.session.lock().await;
        Ok(slot
            .as_ref()
            .map(|s| s.peers.ready_peers())
            .unwrap_or_default())
    }

    /// Pull every file of `site_id` from `peer` into the local store,
    /// reporting `(completed, total, path)` on each file boundary.
    pub async fn import_site(
        &self,
        peer: &str,
        site_id: &str,
        progress: impl FnMut(usize, usize, &str),
    ) -> Result<usize> {
        let transfer = {
            let inner = self.inner()?;
            let slot = inner.session.lock().await;
            slot.as_ref()
                .ok_or_else(|| EngineError::TransportUnavailable("no active session".into()))?
                .transfer
                .clone()
        };
        transfer.import_site(peer, site_id, progress).await
    }

    // ------------------------------------------------------------------
    // Local blob store surface (ingestion, export, interceptor wiring)
    // ------------------------------------------------------------------

    pub fn file_store(&self) -> Result<SharedFileStore> {
        Ok(self.inner()?.files.clone())
    }

    pub fn put_file(
        &self,
        site_id: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<()> {
        let inner = self.inner()?;
        inner
            .files
            .lock()
            .expect("file store lock")
            .put(site_id, path, bytes, content_type)?;
        Ok(())
    }

    pub fn get_file(&self, site_id: &str, path: &str) -> Result<Option<StoredFile>> {
        Ok(self
            .inner()?
            .files
            .lock()
            .expect("file store lock")
            .get(site_id, path)?)
    }

    pub fn list_files(&self, site_id: &str) -> Result<Vec<StoredFile>> {
        Ok(self
            .inner()?
            .files
            .lock()
            .expect("file store lock")
            .list(site_id)?)
    }

    pub fn delete_site_files(&self, site_id: &str) -> Result<usize> {
        Ok(self
            .inner()?
            .files
            .lock()
            .expect("file store lock")
            .delete_site(site_id)?)
    }

    /// Duplicate all blobs of one site under another id (used after adopt).
    pub fn copy_site_files(&self, from_id: &str, to_id: &str) -> Result<usize> {
        Ok(self
            .inner()?
            .files
            .lock()
            .expect("file store lock")
            .copy_site(from_id, to_id)?)
    }

    pub fn site_size(&self, site_id: &str) -> Result<i64> {
        Ok(self
            .inner()?
            .files
            .lock()
            .expect("file store lock")
            .site_size(site_id)?)
    }

    pub fn total_size(&self) -> Result<i64> {
        Ok(self
            .inner()?
            .files
            .lock()
            .expect("file store lock")
            .total_size()?)
    }
}
