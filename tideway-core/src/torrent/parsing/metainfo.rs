//! Torrent descriptor (`.torrent` file) decoding

use serde::Deserialize;

use super::bencode;
use crate::torrent::{InfoHash, TorrentError, TorrentInfo};

/// A decoded torrent descriptor.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub info: TorrentInfo,
    /// Tracker announce URLs, `announce-list` tiers flattened after `announce`
    pub trackers: Vec<String>,
}

/// Top-level keys we read besides `info`, which is decoded from its raw span.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Decodes a complete descriptor.
    ///
    /// The info-hash is the SHA-1 of the `info` value's bytes exactly as they
    /// appear in `data`, so re-encoding differences can never change it.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Not bencode, no `info` dictionary or inconsistent layout
    pub fn from_bytes(data: &[u8]) -> Result<Self, TorrentError> {
        let span = bencode::dictionary_value_span(data, b"info")?;
        if bencode::element_end(data, 0)? != data.len() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "trailing data after descriptor".to_string(),
            });
        }

        let outer: RawMetainfo =
            serde_bencode::from_bytes(data).map_err(|e| TorrentError::InvalidTorrentFile {
                reason: e.to_string(),
            })?;
        let info = TorrentInfo::from_bytes(&data[span])?;

        let mut trackers = Vec::new();
        if let Some(announce) = outer.announce {
            trackers.push(announce);
        }
        for tier in outer.announce_list.unwrap_or_default() {
            for url in tier {
                if !trackers.contains(&url) {
                    trackers.push(url);
                }
            }
        }

        Ok(Self {
            info_hash: info.info_hash(),
            info,
            trackers,
        })
    }
}
