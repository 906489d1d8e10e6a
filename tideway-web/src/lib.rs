//! Tideway Web - HTTP proxy for torrent content
//!
//! `GET /` reports per-file download progress as JSON; every other path
//! streams the matching torrent file with range and conditional request
//! support, pulling pieces from the swarm as the response is written.

pub mod content;
pub mod handlers;
pub mod proxy;
pub mod range;
pub mod status;

use tideway_core::{EngineError, ResolveError, SeedError};

pub use proxy::{HttpListener, ProxyConfig, TorrentProxy};
pub use status::{FileStatus, Readiness, TorrentStatus};

/// Failures starting or running a [`TorrentProxy`].
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Seeds(#[from] SeedError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Cannot listen on {addr}: {reason}")]
    ListenFailed { addr: String, reason: String },

    #[error("HTTP server stopped: {reason}")]
    Server { reason: String },
}
