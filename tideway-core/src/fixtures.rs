//! Test fixtures: generated torrents and an in-memory engine.
//!
//! [`TorrentBuilder`] produces real descriptors with correct piece hashes so
//! the parsing and verification paths run unmodified. [`MemoryClient`] and
//! [`MemoryTorrent`] stand in for the swarm engine and record what callers
//! asked of them.

use std::io::{self, Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::engine::{
    EngineError, FileHandle, PiecePriority, PieceState, TorrentClient, TorrentHandle,
    TorrentReader,
};
use crate::torrent::{InfoHash, Metainfo, TorrentInfo, TorrentSpec};

#[derive(Serialize)]
struct RawDescriptor<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    announce: Option<&'a str>,
    info: RawInfo<'a>,
}

#[derive(Serialize)]
struct RawInfo<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<RawFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    name: &'a str,
    #[serde(rename = "piece length")]
    piece_length: u64,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
}

#[derive(Serialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}

/// Builds a torrent with deterministic content.
#[derive(Debug, Clone)]
pub struct TorrentBuilder {
    name: String,
    single_length: Option<u64>,
    files: Vec<(String, u64)>,
    piece_length: u64,
    tracker: Option<String>,
}

impl TorrentBuilder {
    /// Multi-file torrent; add files with [`TorrentBuilder::file`].
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            single_length: None,
            files: Vec::new(),
            piece_length: 16384,
            tracker: None,
        }
    }

    /// Single-file torrent named `name`.
    pub fn single(name: &str, length: u64) -> Self {
        Self {
            single_length: Some(length),
            ..Self::new(name)
        }
    }

    /// Adds a file; `/` separates path components.
    pub fn file(mut self, path: &str, length: u64) -> Self {
        self.files.push((path.to_string(), length));
        self
    }

    pub fn piece_length(mut self, piece_length: u64) -> Self {
        self.piece_length = piece_length;
        self
    }

    pub fn tracker(mut self, url: &str) -> Self {
        self.tracker = Some(url.to_string());
        self
    }

    pub fn build(self) -> TorrentFixture {
        let total: u64 = self
            .single_length
            .unwrap_or_else(|| self.files.iter().map(|(_, length)| length).sum());
        let content: Vec<u8> = (0..total).map(|i| ((i * 31 + 7) % 251) as u8).collect();
        let pieces: Vec<u8> = content
            .chunks(self.piece_length as usize)
            .flat_map(|piece| Sha1::digest(piece).to_vec())
            .collect();

        let files = match self.single_length {
            Some(_) => None,
            None => Some(
                self.files
                    .iter()
                    .map(|(path, length)| RawFile {
                        length: *length,
                        path: path.split('/').map(str::to_string).collect(),
                    })
                    .collect(),
            ),
        };

        let descriptor = serde_bencode::to_bytes(&RawDescriptor {
            announce: self.tracker.as_deref(),
            info: RawInfo {
                files,
                length: self.single_length,
                name: &self.name,
                piece_length: self.piece_length,
                pieces,
            },
        })
        .expect("fixture descriptor encodes");

        let metainfo = Metainfo::from_bytes(&descriptor).expect("fixture descriptor parses");
        TorrentFixture {
            info_hash: metainfo.info_hash,
            info: Arc::new(metainfo.info.clone()),
            spec: TorrentSpec::from(metainfo),
            descriptor,
            content,
        }
    }
}

/// Generated torrent: descriptor bytes, decoded metadata and content.
#[derive(Debug, Clone)]
pub struct TorrentFixture {
    pub info_hash: InfoHash,
    pub info: Arc<TorrentInfo>,
    pub descriptor: Vec<u8>,
    /// Concatenated bytes of every file
    pub content: Vec<u8>,
    spec: TorrentSpec,
}

impl TorrentFixture {
    pub fn spec(&self) -> TorrentSpec {
        self.spec.clone()
    }

    pub fn magnet(&self) -> String {
        format!("magnet:?xt=urn:btih:{}&dn={}", self.info_hash, self.info.name)
    }

    pub fn file_content(&self, index: usize) -> &[u8] {
        let range = self.info.files[index].byte_range();
        &self.content[range.start as usize..range.end as usize]
    }

    /// Writes every file the way the engine lays them out under `dir`.
    pub fn write_to(&self, dir: &Path) {
        for (index, file) in self.info.files.iter().enumerate() {
            let mut path = dir.join(&self.info.name);
            if self.info.multi_file {
                path.extend(&file.path);
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("fixture directory");
            }
            std::fs::write(&path, self.file_content(index)).expect("fixture file");
        }
    }

    /// Temporary data directory already holding the complete content.
    pub fn temp_data_dir(&self) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("temp dir");
        self.write_to(dir.path());
        dir
    }
}


#[derive(Default)]
struct MemoryShared {
    complete: Mutex<Vec<bool>>,
    prioritized: Mutex<Vec<(usize, u64, u64)>>,
    downloads: Mutex<Vec<usize>>,
}

/// In-memory torrent whose content is always readable.
pub struct MemoryTorrent {
    info_hash: InfoHash,
    name: String,
    info: Option<Arc<TorrentInfo>>,
    content: Arc<Vec<u8>>,
    max_read: usize,
    closed: AtomicBool,
    shared: Arc<MemoryShared>,
}

impl MemoryTorrent {
    /// Torrent with known metadata and no verified pieces.
    pub fn new(fixture: &TorrentFixture) -> Arc<Self> {
        Self::with_max_read(fixture, usize::MAX)
    }

    /// Like [`MemoryTorrent::new`] but readers return at most `max_read` bytes per call.
    pub fn with_max_read(fixture: &TorrentFixture, max_read: usize) -> Arc<Self> {
        let shared = MemoryShared {
            complete: Mutex::new(vec![false; fixture.info.piece_count()]),
            ..MemoryShared::default()
        };
        Arc::new(Self {
            info_hash: fixture.info_hash,
            name: fixture.info.name.clone(),
            info: Some(fixture.info.clone()),
            content: Arc::new(fixture.content.clone()),
            max_read,
            closed: AtomicBool::new(false),
            shared: Arc::new(shared),
        })
    }

    /// Torrent still waiting for metadata.
    pub fn pending(info_hash: InfoHash, name: &str) -> Arc<Self> {
        Arc::new(Self {
            info_hash,
            name: name.to_string(),
            info: None,
            content: Arc::default(),
            max_read: usize::MAX,
            closed: AtomicBool::new(false),
            shared: Arc::default(),
        })
    }

    pub fn complete_all(&self) {
        self.shared.complete.lock().iter_mut().for_each(|c| *c = true);
    }

    pub fn complete_piece(&self, index: usize) {
        if let Some(piece) = self.shared.complete.lock().get_mut(index) {
            *piece = true;
        }
    }

    /// `(file index, offset, length)` of every `prioritize_region` call so far.
    pub fn prioritized(&self) -> Vec<(usize, u64, u64)> {
        self.shared.prioritized.lock().clone()
    }

    /// File indices passed to `download` so far.
    pub fn downloads(&self) -> Vec<usize> {
        self.shared.downloads.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TorrentHandle for MemoryTorrent {
    fn info(&self) -> Option<Arc<TorrentInfo>> {
        self.info.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn files(&self) -> Vec<Arc<dyn FileHandle>> {
        let Some(info) = &self.info else {
            return Vec::new();
        };
        (0..info.files.len())
            .map(|index| {
                Arc::new(MemoryFile {
                    info: info.clone(),
                    shared: self.shared.clone(),
                    index,
                }) as Arc<dyn FileHandle>
            })
            .collect()
    }

    fn new_reader(&self) -> Box<dyn TorrentReader> {
        Box::new(MemoryReader {
            content: self.content.clone(),
            position: 0,
            max_read: self.max_read,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// [`FileHandle`] of a [`MemoryTorrent`].
pub struct MemoryFile {
    info: Arc<TorrentInfo>,
    shared: Arc<MemoryShared>,
    index: usize,
}

impl FileHandle for MemoryFile {
    fn path(&self) -> String {
        self.info.display_path(&self.info.files[self.index])
    }

    fn length(&self) -> u64 {
        self.info.files[self.index].length
    }

    fn offset(&self) -> u64 {
        self.info.files[self.index].offset
    }

    fn piece_states(&self) -> Vec<PieceState> {
        let complete = self.shared.complete.lock();
        self.info
            .pieces_for_range(self.info.files[self.index].byte_range())
            .map(|index| PieceState {
                complete: complete.get(index).copied().unwrap_or(false),
                checking: false,
                priority: PiecePriority::None,
            })
            .collect()
    }

    fn download(&self) {
        self.shared.downloads.lock().push(self.index);
    }

    fn prioritize_region(&self, offset: u64, length: u64) {
        self.shared.prioritized.lock().push((self.index, offset, length));
    }
}

/// Reader over a [`MemoryTorrent`]'s content.
pub struct MemoryReader {
    content: Arc<Vec<u8>>,
    position: u64,
    max_read: usize,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = (self.position as usize).min(self.content.len());
        let count = buf.len().min(self.max_read).min(self.content.len() - start);
        buf[..count].copy_from_slice(&self.content[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => (self.content.len() as u64).checked_add_signed(delta),
        };
        self.position = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "negative position"))?;
        Ok(self.position)
    }
}

impl TorrentReader for MemoryReader {
    fn position(&self) -> u64 {
        self.position
    }
}

/// [`TorrentClient`] that hands out one prepared [`MemoryTorrent`].
pub struct MemoryClient {
    torrent: Arc<MemoryTorrent>,
    added: Mutex<Vec<TorrentSpec>>,
    closed: AtomicBool,
}

impl MemoryClient {
    pub fn new(torrent: Arc<MemoryTorrent>) -> Arc<Self> {
        Arc::new(Self {
            torrent,
            added: Mutex::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Specs passed to `add_torrent` so far.
    pub fn added(&self) -> Vec<TorrentSpec> {
        self.added.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TorrentClient for MemoryClient {
    fn add_torrent(&self, spec: TorrentSpec) -> Result<Arc<dyn TorrentHandle>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.added.lock().push(spec);
        Ok(self.torrent.clone())
    }

    fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 6881))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.torrent.close();
    }
}
