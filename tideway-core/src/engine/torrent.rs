//! Per-torrent state shared by peer sessions, trackers, readers and handles

use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc, watch};

use super::client::EngineContext;
use super::metadata::MetadataAssembly;
use super::pieces::PieceTable;
use super::reader::SwarmReader;
use super::storage::{StorageError, TorrentStorage};
use super::{FileHandle, PiecePriority, PieceState, TorrentHandle, TorrentReader};
use crate::torrent::{InfoHash, PieceIndex, TorrentInfo, TorrentSpec};

/// Content-dependent state, available once metadata is known.
#[derive(Debug)]
pub(crate) struct Loaded {
    pub info: Arc<TorrentInfo>,
    pub storage: TorrentStorage,
    pub pieces: PieceTable,
}

pub(crate) struct TorrentState {
    pub info_hash: InfoHash,
    display_name: Option<String>,
    pub trackers: Vec<String>,
    pub context: Arc<EngineContext>,
    loaded: OnceLock<Loaded>,
    metadata: Mutex<MetadataAssembly>,
    /// Wakes peer sessions when wanted pieces or metadata change
    pub wanted: Notify,
    completed_tx: broadcast::Sender<u32>,
    shutdown_tx: watch::Sender<bool>,
    peers_tx: mpsc::UnboundedSender<SocketAddr>,
    pub active_peers: AtomicUsize,
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
}

impl TorrentState {
    /// Creates the state and the receiving end of its peer address queue.
    pub fn new(
        spec: &TorrentSpec,
        context: Arc<EngineContext>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SocketAddr>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let (completed_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        let state = Arc::new(Self {
            info_hash: spec.info_hash,
            display_name: spec.display_name.clone(),
            trackers: spec.trackers.clone(),
            context,
            loaded: OnceLock::new(),
            metadata: Mutex::new(MetadataAssembly::new(spec.info_hash)),
            wanted: Notify::new(),
            completed_tx,
            shutdown_tx,
            peers_tx,
            active_peers: AtomicUsize::new(0),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        });
        (state, peers_rx)
    }

    pub fn loaded(&self) -> Option<&Loaded> {
        self.loaded.get()
    }

    pub fn name(&self) -> String {
        self.loaded()
            .map(|loaded| loaded.info.name.clone())
            .or_else(|| self.display_name.clone())
            .unwrap_or_default()
    }

    /// Installs metadata and starts checking existing data on disk.
    ///
    /// Later calls are ignored once metadata is set.
    ///
    /// # Errors
    /// - `StorageError::UnsafePath` - Metadata lists paths outside the data directory
    pub fn install_info(self: &Arc<Self>, info: Arc<TorrentInfo>) -> Result<(), StorageError> {
        if self.loaded.get().is_some() {
            return Ok(());
        }

        let storage = TorrentStorage::new(&self.context.data_dir, &info)?;
        let pieces = PieceTable::new(info.piece_count());
        let installed = self
            .loaded
            .set(Loaded {
                info,
                storage,
                pieces,
            })
            .is_ok();

        if installed {
            if *self.shutdown_tx.borrow() {
                if let Some(loaded) = self.loaded() {
                    loaded.pieces.close();
                }
                return Ok(());
            }
            self.spawn_verification();
            self.wanted.notify_waiters();
        }
        Ok(())
    }

    fn spawn_verification(self: &Arc<Self>) {
        let state = self.clone();
        self.context.runtime.spawn_blocking(move || {
            let Some(loaded) = state.loaded() else {
                return;
            };

            let mut verified = 0;
            for index in 0..loaded.info.piece_count() {
                if loaded.pieces.is_closed() {
                    return;
                }
                let ok = loaded
                    .storage
                    .verify_piece(&loaded.info, PieceIndex::new(index as u32))
                    .unwrap_or_else(|e| {
                        tracing::warn!("Checking piece {} of {} failed: {}", index, state.info_hash, e);
                        false
                    });
                loaded.pieces.finish_check(index, ok);
                if ok {
                    verified += 1;
                    let _ = state.completed_tx.send(index as u32);
                }
            }

            tracing::info!(
                "Verified {}/{} pieces of '{}' already on disk",
                verified,
                loaded.info.piece_count(),
                loaded.info.name
            );
            state.wanted.notify_waiters();
        });
    }

    /// Raises priority for a torrent byte range and wakes peer sessions.
    pub fn prioritize_bytes(&self, range: Range<u64>, priority: PiecePriority) {
        if let Some(loaded) = self.loaded() {
            loaded
                .pieces
                .raise_priority(loaded.info.pieces_for_range(range), priority);
            self.wanted.notify_waiters();
        }
    }

    /// Records a downloaded and verified piece.
    pub fn piece_completed(&self, index: usize) {
        if let Some(loaded) = self.loaded()
            && loaded.pieces.mark_complete(index)
        {
            let _ = self.completed_tx.send(index as u32);
        }
    }

    pub fn subscribe_completed(&self) -> broadcast::Receiver<u32> {
        self.completed_tx.subscribe()
    }

    pub fn metadata_size_hint(&self, size: usize) {
        self.metadata.lock().set_size(size);
    }

    pub fn next_metadata_request(&self) -> Option<u32> {
        self.metadata.lock().next_request(std::time::Instant::now())
    }

    pub fn metadata_rejected(&self, piece: u32) {
        self.metadata.lock().reject(piece);
    }

    /// Feeds a metadata piece; installs the info dictionary once complete.
    pub fn metadata_received(self: &Arc<Self>, piece: u32, total_size: usize, data: bytes::Bytes) {
        let assembled = self.metadata.lock().receive(piece, total_size, data);
        let Some(raw) = assembled else {
            return;
        };

        match TorrentInfo::from_bytes(&raw) {
            Ok(info) => {
                tracing::info!(
                    "Received metadata for '{}' ({} files, {} pieces)",
                    info.name,
                    info.files.len(),
                    info.piece_count()
                );
                if let Err(e) = self.install_info(Arc::new(info)) {
                    tracing::warn!("Cannot store torrent {}: {}", self.info_hash, e);
                }
            }
            Err(e) => tracing::warn!("Metadata for {} did not decode: {}", self.info_hash, e),
        }
    }

    /// Queues candidate peer addresses for the connection manager.
    pub fn add_peers(&self, peers: impl IntoIterator<Item = SocketAddr>) {
        for peer in peers {
            if self.peers_tx.send(peer).is_err() {
                break;
            }
        }
    }

    /// Bytes still missing, as reported to trackers.
    pub fn bytes_left(&self) -> u64 {
        match self.loaded() {
            Some(loaded) => {
                let done = loaded.pieces.completed() as u64 * loaded.info.piece_length;
                loaded.info.total_length.saturating_sub(done)
            }
            // Non-zero so trackers treat us as a leecher before metadata arrives
            None => 1,
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        if let Some(loaded) = self.loaded() {
            loaded.pieces.close();
        }
        self.wanted.notify_waiters();
        tracing::debug!("Closed torrent {}", self.info_hash);
    }
}

/// [`TorrentHandle`] backed by the swarm engine.
pub(crate) struct SwarmTorrent {
    state: Arc<TorrentState>,
}

impl SwarmTorrent {
    pub fn new(state: Arc<TorrentState>) -> Self {
        Self { state }
    }
}

impl TorrentHandle for SwarmTorrent {
    fn info(&self) -> Option<Arc<TorrentInfo>> {
        self.state.loaded().map(|loaded| loaded.info.clone())
    }

    fn name(&self) -> String {
        self.state.name()
    }

    fn info_hash(&self) -> InfoHash {
        self.state.info_hash
    }

    fn files(&self) -> Vec<Arc<dyn FileHandle>> {
        let Some(loaded) = self.state.loaded() else {
            return Vec::new();
        };
        (0..loaded.info.files.len())
            .map(|index| {
                Arc::new(SwarmFile {
                    state: self.state.clone(),
                    index,
                }) as Arc<dyn FileHandle>
            })
            .collect()
    }

    fn new_reader(&self) -> Box<dyn TorrentReader> {
        Box::new(SwarmReader::new(self.state.clone()))
    }

    fn close(&self) {
        self.state.close();
    }
}

/// [`FileHandle`] for file `index` of a loaded torrent.
pub(crate) struct SwarmFile {
    state: Arc<TorrentState>,
    index: usize,
}

impl SwarmFile {
    fn with_entry<T>(&self, default: T, f: impl FnOnce(&Loaded, &crate::torrent::FileEntry) -> T) -> T {
        match self.state.loaded() {
            Some(loaded) => match loaded.info.files.get(self.index) {
                Some(entry) => f(loaded, entry),
                None => default,
            },
            None => default,
        }
    }
}

impl FileHandle for SwarmFile {
    fn path(&self) -> String {
        self.with_entry(String::new(), |loaded, entry| loaded.info.display_path(entry))
    }

    fn length(&self) -> u64 {
        self.with_entry(0, |_, entry| entry.length)
    }

    fn offset(&self) -> u64 {
        self.with_entry(0, |_, entry| entry.offset)
    }

    fn piece_states(&self) -> Vec<PieceState> {
        self.with_entry(Vec::new(), |loaded, entry| {
            loaded
                .pieces
                .states(loaded.info.pieces_for_range(entry.byte_range()))
        })
    }

    fn download(&self) {
        let range = self.with_entry(0..0, |_, entry| entry.byte_range());
        self.state.prioritize_bytes(range, PiecePriority::Normal);
    }

    fn prioritize_region(&self, offset: u64, length: u64) {
        let range = self.with_entry(0..0, |_, entry| {
            let start = entry.offset + offset.min(entry.length);
            let end = entry.offset + offset.saturating_add(length).min(entry.length);
            start..end
        });
        self.state.prioritize_bytes(range, PiecePriority::High);
    }
}
