//! Tideway Core - torrent resolution, swarm engine and seekable file streams
//!
//! Turns a torrent locator (magnet link or descriptor URL) into a running
//! swarm download and exposes each file of the torrent as a blocking
//! `Read + Seek` stream that pulls pieces on demand.

pub mod config;
pub mod engine;
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

pub use config::{EngineConfig, NetworkConfig, StreamingConfig, TidewayConfig};
pub use engine::{
    ClientConfig, EngineError, FileHandle, PiecePriority, PieceState, SwarmClient, TorrentClient,
    TorrentHandle, TorrentReader,
};
pub use streaming::{FileStream, StreamError};
pub use torrent::{
    InfoHash, ResolveError, SeedAddress, SeedError, SpecResolver, TorrentError, TorrentInfo,
    TorrentSpec, resolve_seed_addresses,
};
