//! Swarm engine and the capabilities the HTTP layer relies on.
//!
//! The proxy only talks to the traits defined here: a [`TorrentClient`]
//! hands out [`TorrentHandle`]s, which expose [`FileHandle`]s and blocking
//! [`TorrentReader`]s. [`SwarmClient`] is the bundled implementation.

pub mod client;
pub mod discovery;
mod metadata;
mod peer;
pub mod pieces;
mod reader;
pub mod storage;
mod torrent;
pub mod tracker;

use std::io::{Read, Seek};
use std::net::SocketAddr;
use std::sync::Arc;

pub use client::{ClientConfig, SwarmClient, normalize_listen_addr};
pub use pieces::PieceTable;
pub use storage::{StorageError, TorrentStorage};

use crate::torrent::{InfoHash, TorrentInfo, TorrentSpec};

/// Download urgency of a piece. Higher priorities are requested first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PiecePriority {
    /// Not wanted
    #[default]
    None,
    /// Part of a file somebody asked for
    Normal,
    /// Read-ahead window of an active reader
    High,
    /// A reader is blocked on it
    Now,
}

/// Snapshot of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PieceState {
    pub complete: bool,
    /// Hash check of existing data still pending
    pub checking: bool,
    pub priority: PiecePriority,
}

/// Blocking sequential reader over a torrent's concatenated byte space.
///
/// Reads wait until the pieces they touch are downloaded and verified.
pub trait TorrentReader: Read + Seek + Send {
    /// Current absolute position in the torrent.
    fn position(&self) -> u64;
}

/// One file of a torrent with known metadata.
pub trait FileHandle: Send + Sync {
    /// Display path: components joined with `/`, or the torrent name for single-file torrents.
    fn path(&self) -> String;
    fn length(&self) -> u64;
    /// Position of the file's first byte in the torrent.
    fn offset(&self) -> u64;
    /// States of every piece overlapping the file, in order.
    fn piece_states(&self) -> Vec<PieceState>;
    /// Marks the whole file as wanted.
    fn download(&self);
    /// Raises priority for `length` bytes starting `offset` bytes into the file.
    fn prioritize_region(&self, offset: u64, length: u64);
}

/// A torrent added to a client.
pub trait TorrentHandle: Send + Sync {
    /// Decoded metadata, `None` until it has been fetched from peers.
    fn info(&self) -> Option<Arc<TorrentInfo>>;
    fn name(&self) -> String;
    fn info_hash(&self) -> InfoHash;
    /// Files in descriptor order; empty until metadata is known.
    fn files(&self) -> Vec<Arc<dyn FileHandle>>;
    /// Fresh reader positioned at torrent offset 0.
    fn new_reader(&self) -> Box<dyn TorrentReader>;
    /// Stops all activity for this torrent and fails blocked readers.
    fn close(&self);
}

/// A running swarm engine.
pub trait TorrentClient: Send + Sync {
    /// Adds a torrent, or returns the existing handle for the same info-hash.
    ///
    /// # Errors
    /// - `EngineError::Closed` - The client has been shut down
    /// - `EngineError::Storage` - The data directory cannot be used
    fn add_torrent(&self, spec: TorrentSpec) -> Result<Arc<dyn TorrentHandle>, EngineError>;
    /// Address accepting incoming peer connections.
    fn listen_addr(&self) -> SocketAddr;
    /// Stops the engine and every torrent. Safe to call more than once.
    fn close(&self);
}

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Cannot listen on {addr}: {reason}")]
    ListenFailed { addr: String, reason: String },

    #[error("Peer discovery failed: {reason}")]
    Discovery { reason: String },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("Engine is closed")]
    Closed,
}
