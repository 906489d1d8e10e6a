//! Engine-ready description of a torrent

use std::sync::Arc;

use super::{InfoHash, MagnetLink, Metainfo, TorrentInfo};

/// What the engine needs to join a swarm.
///
/// Built from a magnet link (info-hash only, metadata fetched from peers)
/// or from a descriptor file (metadata known up front).
#[derive(Debug, Clone)]
pub struct TorrentSpec {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub info: Option<Arc<TorrentInfo>>,
    pub trackers: Vec<String>,
}

impl TorrentSpec {
    /// Spec carrying only an info-hash.
    pub fn from_info_hash(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            display_name: None,
            info: None,
            trackers: Vec::new(),
        }
    }

    /// Name to show before metadata is known.
    pub fn name(&self) -> Option<&str> {
        self.info
            .as_ref()
            .map(|info| info.name.as_str())
            .or(self.display_name.as_deref())
    }
}

impl From<MagnetLink> for TorrentSpec {
    fn from(magnet: MagnetLink) -> Self {
        Self {
            info_hash: magnet.info_hash,
            display_name: magnet.display_name,
            info: None,
            trackers: magnet.trackers,
        }
    }
}

impl From<Metainfo> for TorrentSpec {
    fn from(metainfo: Metainfo) -> Self {
        Self {
            info_hash: metainfo.info_hash,
            display_name: Some(metainfo.info.name.clone()),
            trackers: metainfo.trackers,
            info: Some(Arc::new(metainfo.info)),
        }
    }
}
