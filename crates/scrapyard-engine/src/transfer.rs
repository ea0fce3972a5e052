//! File-transfer protocol.
//!
//! Multiplexed on the per-peer channel inside `custom` envelopes tagged
//! `file-transfer`. The responder answers `file-list-request` from its local
//! store and streams requested files as base64 chunks of at most 64 KiB with
//! a short cooperative yield between chunks. The requester drives
//! [`TransferEngine::import_site`]: list the site, then fetch each file with
//! its own deadline, landing completed blobs in the local store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use scrapyard_net::{NetError, PeerManager};
use scrapyard_shared::constants::{
    CHUNK_SIZE, CHUNK_YIELD_MS, FILE_LIST_TIMEOUT_SECS, FILE_TIMEOUT_SECS,
};
use scrapyard_shared::protocol::{FileEntry, PeerMessage, TransferMessage};
use scrapyard_store::{FileStore, StoredFile};

use crate::error::{EngineError, Result};
use crate::events::CatalogEvent;

/// Outbound seam so the protocol can run over mock channels in tests.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send(&self, peer_id: &str, msg: PeerMessage) -> std::result::Result<(), NetError>;
}

#[async_trait]
impl PeerSender for PeerManager {
    async fn send(&self, peer_id: &str, msg: PeerMessage) -> std::result::Result<(), NetError> {
        self.send_to(peer_id, &msg).await
    }
}

/// `(peer, site, path)`.
type TransferKey = (String, String, String);

struct IncomingTransfer {
    content_type: String,
    expected: u64,
    chunks: Vec<Vec<u8>>,
    received: u64,
}

/// Both sides of the file-transfer protocol for one node.
pub struct TransferEngine {
    files: Arc<Mutex<FileStore>>,
    sender: Arc<dyn PeerSender>,
    events: mpsc::UnboundedSender<CatalogEvent>,
    incoming: Mutex<HashMap<TransferKey, IncomingTransfer>>,
    pending_lists: Mutex<HashMap<(String, String), oneshot::Sender<Result<Vec<FileEntry>>>>>,
    pending_files: Mutex<HashMap<TransferKey, oneshot::Sender<Result<()>>>>,
    list_timeout: Duration,
    file_timeout: Duration,
}

impl TransferEngine {
    pub fn new(
        files: Arc<Mutex<FileStore>>,
        sender: Arc<dyn PeerSender>,
        events: mpsc::UnboundedSender<CatalogEvent>,
    ) -> Self {
        Self {
            files,
            sender,
            events,
            incoming: Mutex::new(HashMap::new()),
            pending_lists: Mutex::new(HashMap::new()),
            pending_files: Mutex::new(HashMap::new()),
            list_timeout: Duration::from_secs(FILE_LIST_TIMEOUT_SECS),
            file_timeout: Duration::from_secs(FILE_TIMEOUT_SECS),
        }
    }

    #[cfg(test)]
    fn with_timeouts(mut self, list: Duration, file: Duration) -> Self {
        self.list_timeout = list;
        self.file_timeout = file;
        self
    }

    /// Pull every file of `site_id` from `peer` into the local store.
    ///
    /// `progress` is invoked with `(completed, total, path)` on each file
    /// start and completion. Files are fetched sequentially; the first
    /// failure aborts the import, leaving already-landed blobs in place.
    pub async fn import_site(
        &self,
        peer: &str,
        site_id: &str,
        mut progress: impl FnMut(usize, usize, &str),
    ) -> Result<usize> {
        let files = self.request_file_list(peer, site_id).await?;
        let total = files.len();
        debug!(peer, site = site_id, total, "importing site");

        for (done, entry) in files.iter().enumerate() {
            progress(done, total, &entry.path);
            self.request_file(peer, site_id, &entry.path).await?;
            progress(done + 1, total, &entry.path);
        }
        Ok(total)
    }

    async fn request_file_list(&self, peer: &str, site_id: &str) -> Result<Vec<FileEntry>> {
        let (tx, rx) = oneshot::channel();
        self.pending_lists
            .lock()
            .expect("pending lock")
            .insert((peer.to_string(), site_id.to_string()), tx);

        let request = TransferMessage::FileListRequest {
            site_id: site_id.to_string(),
        };
        self.sender.send(peer, request.into_custom()).await?;

        match timeout(self.list_timeout, rx).await {
            Err(_) => {
                self.pending_lists
                    .lock()
                    .expect("pending lock")
                    .remove(&(peer.to_string(), site_id.to_string()));
                Err(EngineError::Timeout("file-list".into()))
            }
            Ok(Err(_)) => Err(EngineError::PeerGone(peer.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    async fn request_file(&self, peer: &str, site_id: &str, path: &str) -> Result<()> {
        let key = (peer.to_string(), site_id.to_string(), path.to_string());
        let (tx, rx) = oneshot::channel();
        self.pending_files
            .lock()
            .expect("pending lock")
            .insert(key.clone(), tx);

        let request = TransferMessage::FileRequest {
            site_id: site_id.to_string(),
            path: path.to_string(),
        };
        self.sender.send(peer, request.into_custom()).await?;

        match timeout(self.file_timeout, rx).await {
            Err(_) => {
                self.pending_files.lock().expect("pending lock").remove(&key);
                self.incoming.lock().expect("incoming lock").remove(&key);
                Err(EngineError::Timeout(path.to_string()))
            }
            Ok(Err(_)) => Err(EngineError::PeerGone(peer.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    /// Dispatch one inbound file-transfer envelope. Malformed payloads are
    /// logged and dropped; nothing here tears the channel down.
    pub async fn handle_message(&self, peer_id: &str, msg: TransferMessage) {
        match msg {
            TransferMessage::FileListRequest { site_id } => {
                self.answer_file_list(peer_id, &site_id).await;
            }
            TransferMessage::FileList { site_id, files } => {
                let pending = self
                    .pending_lists
                    .lock()
                    .expect("pending lock")
                    .remove(&(peer_id.to_string(), site_id.clone()));
                match pending {
                    Some(tx) => {
                        let _ = tx.send(Ok(files));
                    }
                    None => debug!(peer = peer_id, site = %site_id, "unsolicited file list"),
                }
            }
            TransferMessage::FileRequest { site_id, path } => {
                self.answer_file_request(peer_id, &site_id, &path).await;
            }
            TransferMessage::FileStart {
                site_id,
                path,
                content_type,
                size,
            } => {
                self.incoming.lock().expect("incoming lock").insert(
                    (peer_id.to_string(), site_id, path),
                    IncomingTransfer {
                        content_type,
                        expected: size,
                        chunks: Vec::new(),
                        received: 0,
                    },
                );
            }
            TransferMessage::FileChunk {
                site_id,
                path,
                data,
            } => {
                self.accept_chunk(peer_id, &site_id, &path, &data);
            }
            TransferMessage::FileEnd { site_id, path } => {
                self.finish_transfer(peer_id, &site_id, &path);
            }
        }
    }

    async fn answer_file_list(&self, peer_id: &str, site_id: &str) {
        let entries = match self.files.lock().expect("file store lock").list_entries(site_id) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(site = site_id, error = %e, "file list query failed");
                return;
            }
        };
        let reply = TransferMessage::FileList {
            site_id: site_id.to_string(),
            files: entries,
        };
        if let Err(e) = self.sender.send(peer_id, reply.into_custom()).await {
            warn!(peer = peer_id, error = %e, "file list reply failed");
        }
    }

    async fn answer_file_request(&self, peer_id: &str, site_id: &str, path: &str) {
        let file = match self.files.lock().expect("file store lock").get(site_id, path) {
            Ok(Some(file)) => file,
            Ok(None) => {
                // Unknown files are dropped on the floor, not answered.
                warn!(peer = peer_id, site = site_id, path, "requested unknown file");
                return;
            }
            Err(e) => {
                warn!(site = site_id, path, error = %e, "file lookup failed");
                return;
            }
        };

        let sender = self.sender.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = stream_file(sender.as_ref(), &peer, &file).await {
                warn!(peer = %peer, path = %file.path, error = %e, "file stream aborted");
            }
        });
    }

    fn accept_chunk(&self, peer_id: &str, site_id: &str, path: &str, data: &str) {
        let bytes = match BASE64.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = peer_id, path, error = %e, "undecodable chunk dropped");
                return;
            }
        };

        let key = (peer_id.to_string(), site_id.to_string(), path.to_string());
        let mut incoming = self.incoming.lock().expect("incoming lock");
        let Some(transfer) = incoming.get_mut(&key) else {
            debug!(peer = peer_id, path, "chunk without transfer dropped");
            return;
        };
        transfer.received += bytes.len() as u64;
        transfer.chunks.push(bytes);

        let _ = self.events.send(CatalogEvent::TransferProgress {
            site_id: site_id.to_string(),
            path: path.to_string(),
            received: transfer.received,
            total: transfer.expected,
        });
    }

    fn finish_transfer(&self, peer_id: &str, site_id: &str, path: &str) {
        let key = (peer_id.to_string(), site_id.to_string(), path.to_string());
        let Some(transfer) = self.incoming.lock().expect("incoming lock").remove(&key) else {
            debug!(peer = peer_id, path, "file-end without transfer");
            return;
        };

        let mut bytes = Vec::with_capacity(transfer.received as usize);
        for chunk in &transfer.chunks {
            bytes.extend_from_slice(chunk);
        }

        let stored = self
            .files
            .lock()
            .expect("file store lock")
            .put(site_id, path, &bytes, &transfer.content_type);

        let result = stored.map_err(EngineError::from);
        if let Some(tx) = self.pending_files.lock().expect("pending lock").remove(&key) {
            let _ = tx.send(result);
        } else if let Err(e) = result {
            warn!(site = site_id, path, error = %e, "storing pushed file failed");
        }
    }

    /// Drop all transfer state tied to a departed peer, failing its
    /// outstanding requests with `PeerGone`.
    pub fn peer_gone(&self, peer_id: &str) {
        self.incoming
            .lock()
            .expect("incoming lock")
            .retain(|(peer, _, _), _| peer != peer_id);

        let lists: Vec<_> = {
            let mut pending = self.pending_lists.lock().expect("pending lock");
            let keys: Vec<_> = pending
                .keys()
                .filter(|(peer, _)| peer == peer_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| pending.remove(&k)).collect()
        };
        for tx in lists {
            let _ = tx.send(Err(EngineError::PeerGone(peer_id.to_string())));
        }

        let files: Vec<_> = {
            let mut pending = self.pending_files.lock().expect("pending lock");
            let keys: Vec<_> = pending
                .keys()
                .filter(|(peer, _, _)| peer == peer_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| pending.remove(&k)).collect()
        };
        for tx in files {
            let _ = tx.send(Err(EngineError::PeerGone(peer_id.to_string())));
        }
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        !self.pending_lists.lock().unwrap().is_empty()
            || !self.pending_files.lock().unwrap().is_empty()
            || !self.incoming.lock().unwrap().is_empty()
    }
}

/// Stream one file: `file-start`, 64 KiB base64 chunks with a short yield
/// between them, then `file-end`.
async fn stream_file(
    sender: &dyn PeerSender,
    peer: &str,
    file: &StoredFile,
) -> std::result::Result<(), NetError> {
    let start = TransferMessage::FileStart {
        site_id: file.site_id.clone(),
        path: file.path.clone(),
        content_type: file.content_type.clone(),
        size: file.bytes.len() as u64,
    };
    sender.send(peer, start.into_custom()).await?;

    for chunk in file.bytes.chunks(CHUNK_SIZE) {
        let msg = TransferMessage::FileChunk {
            site_id: file.site_id.clone(),
            path: file.path.clone(),
            data: BASE64.encode(chunk),
        };
        sender.send(peer, msg.into_custom()).await?;
        tokio::time::sleep(Duration::from_millis(CHUNK_YIELD_MS)).await;
    }

    let end = TransferMessage::FileEnd {
        site_id: file.site_id.clone(),
        path: file.path.clone(),
    };
    sender.send(peer, end.into_custom()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn file_store() -> (Arc<Mutex<FileStore>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open_at(&dir.path().join("files.db")).unwrap();
        (Arc::new(Mutex::new(store)), dir)
    }

    fn events() -> mpsc::UnboundedSender<CatalogEvent> {
        mpsc::unbounded_channel().0
    }

    /// Sender that forwards every transfer envelope to another engine's
    /// `handle_message`, as if it had crossed a data channel.
    #[derive(Default)]
    struct Loopback {
        from: String,
        target: OnceLock<Arc<TransferEngine>>,
    }

    #[async_trait]
    impl PeerSender for Loopback {
        async fn send(
            &self,
            _peer_id: &str,
            msg: PeerMessage,
        ) -> std::result::Result<(), NetError> {
            let PeerMessage::Custom { data, .. } = msg else {
                return Ok(());
            };
            let parsed: TransferMessage = serde_json::from_value(data).unwrap();
            let target = self.target.get().expect("loopback wired").clone();
            let from = self.from.clone();
            tokio::spawn(async move {
                target.handle_message(&from, parsed).await;
            });
            Ok(())
        }
    }

    /// Sender that records outbound envelopes without delivering them.
    #[derive(Default)]
    struct Capture {
        sent: Arc<Mutex<Vec<TransferMessage>>>,
    }

    #[async_trait]
    impl PeerSender for Capture {
        async fn send(
            &self,
            _peer_id: &str,
            msg: PeerMessage,
        ) -> std::result::Result<(), NetError> {
            if let PeerMessage::Custom { data, .. } = msg {
                self.sent
                    .lock()
                    .unwrap()
                    .push(serde_json::from_value(data).unwrap());
            }
            Ok(())
        }
    }

    /// Wire two engines back-to-back: `a` is peer "A" from b's view and
    /// vice versa.
    fn wired_pair(
        a_files: Arc<Mutex<FileStore>>,
        b_files: Arc<Mutex<FileStore>>,
    ) -> (Arc<TransferEngine>, Arc<TransferEngine>) {
        let a_out = Arc::new(Loopback {
            from: "A".into(),
            target: OnceLock::new(),
        });
        let b_out = Arc::new(Loopback {
            from: "B".into(),
            target: OnceLock::new(),
        });
        let a = Arc::new(TransferEngine::new(a_files, a_out.clone(), events()));
        let b = Arc::new(TransferEngine::new(b_files, b_out.clone(), events()));
        a_out.target.set(b.clone()).ok().unwrap();
        b_out.target.set(a.clone()).ok().unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn import_round_trips_every_file() {
        let (a_files, _da) = file_store();
        let (b_files, _db) = file_store();
        {
            let store = a_files.lock().unwrap();
            store.put("site-1", "index.html", b"<html>home</html>", "text/html").unwrap();
            store
                .put("site-1", "assets/app.js", &vec![0xAB; 100_000], "text/javascript")
                .unwrap();
            store.put("site-1", "style.css", b"body{}", "text/css").unwrap();
        }

        let (_a, b) = wired_pair(a_files.clone(), b_files.clone());

        let mut seen = Vec::new();
        let imported = b
            .import_site("A", "site-1", |done, total, path| {
                seen.push((done, total, path.to_string()));
            })
            .await
            .unwrap();

        assert_eq!(imported, 3);
        let store = b_files.lock().unwrap();
        assert_eq!(
            store.get("site-1", "index.html").unwrap().unwrap().bytes,
            b"<html>home</html>"
        );
        assert_eq!(
            store.get("site-1", "assets/app.js").unwrap().unwrap().bytes,
            vec![0xAB; 100_000]
        );
        assert_eq!(
            store.get("site-1", "style.css").unwrap().unwrap().content_type,
            "text/css"
        );

        // Start and completion callbacks for each of three files.
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], (0, 3, "assets/app.js".to_string()));
        assert_eq!(seen[5], (3, 3, "style.css".to_string()));
        assert!(!b.has_pending());
    }

    #[tokio::test]
    async fn chunks_stay_under_the_frame_limit() {
        let (files, _dir) = file_store();
        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        files
            .lock()
            .unwrap()
            .put("s", "big.bin", &payload, "application/octet-stream")
            .unwrap();

        let capture = Arc::new(Capture::default());
        let engine = TransferEngine::new(files, capture.clone(), events());
        engine
            .handle_message(
                "B",
                TransferMessage::FileRequest {
                    site_id: "s".into(),
                    path: "big.bin".into(),
                },
            )
            .await;

        // Streaming runs on a spawned task; wait for the trailing file-end.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let sent = capture.sent.lock().unwrap();
                if matches!(sent.last(), Some(TransferMessage::FileEnd { .. })) {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "stream never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let sent = capture.sent.lock().unwrap();
        assert!(matches!(
            sent.first(),
            Some(TransferMessage::FileStart { size, .. }) if *size == 150_000
        ));

        let mut rebuilt = Vec::new();
        for msg in sent.iter() {
            if let TransferMessage::FileChunk { data, .. } = msg {
                let chunk = BASE64.decode(data).unwrap();
                assert!(chunk.len() <= CHUNK_SIZE);
                rebuilt.extend_from_slice(&chunk);
            }
        }
        assert_eq!(rebuilt, payload);
    }

    #[tokio::test]
    async fn unknown_file_request_is_silently_dropped() {
        let (files, _dir) = file_store();
        let capture = Arc::new(Capture::default());
        let engine = TransferEngine::new(files, capture.clone(), events());

        engine
            .handle_message(
                "B",
                TransferMessage::FileRequest {
                    site_id: "s".into(),
                    path: "nope.txt".into(),
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(capture.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_timeout_releases_pending_state() {
        let (files, _dir) = file_store();
        // A sender that swallows everything: the remote never answers.
        let engine = TransferEngine::new(files, Arc::new(Capture::default()), events())
            .with_timeouts(Duration::from_millis(50), Duration::from_millis(50));

        let err = engine
            .import_site("A", "site-1", |_, _, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(what) if what == "file-list"));
        assert!(!engine.has_pending());
    }

    #[tokio::test]
    async fn file_timeout_names_the_path() {
        let (files, _dir) = file_store();
        let capture = Arc::new(Capture::default());
        let engine = Arc::new(
            TransferEngine::new(files, capture, events())
                .with_timeouts(Duration::from_millis(200), Duration::from_millis(50)),
        );

        // Answer the list out-of-band, then never serve the file.
        let driver = engine.clone();
        let import = tokio::spawn(async move {
            driver
                .import_site("A", "site-1", |_, _, _| {})
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine
            .handle_message(
                "A",
                TransferMessage::FileList {
                    site_id: "site-1".into(),
                    files: vec![FileEntry {
                        path: "stuck.txt".into(),
                        size: 3,
                        content_type: "text/plain".into(),
                    }],
                },
            )
            .await;

        let err = import.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Timeout(path) if path == "stuck.txt"));
        assert!(!engine.has_pending());
    }

    #[tokio::test]
    async fn peer_gone_rejects_outstanding_requests() {
        let (files, _dir) = file_store();
        let engine = Arc::new(TransferEngine::new(
            files,
            Arc::new(Capture::default()),
            events(),
        ));

        let driver = engine.clone();
        let import =
            tokio::spawn(async move { driver.import_site("A", "site-1", |_, _, _| {}).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Simulate a mid-flight incoming transfer from the same peer.
        engine
            .handle_message(
                "A",
                TransferMessage::FileStart {
                    site_id: "site-1".into(),
                    path: "half.bin".into(),
                    content_type: "application/octet-stream".into(),
                    size: 10,
                },
            )
            .await;

        engine.peer_gone("A");

        let err = import.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::PeerGone(peer) if peer == "A"));
        assert!(!engine.has_pending());
    }
}
