//! Metadata exchange for magnet links (BEP 9 over BEP 10)

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::torrent::parsing::bencode;
use crate::torrent::{InfoHash, TorrentError};

/// Size of one metadata piece.
pub(crate) const METADATA_PIECE_LEN: usize = 16384;

/// Largest info dictionary we are willing to assemble.
pub(crate) const MAX_METADATA_LEN: usize = 16 * 1024 * 1024;

/// Extension id we assign to `ut_metadata` in our handshake.
pub(crate) const UT_METADATA_ID: u8 = 1;

const REQUEST_RETRY: Duration = Duration::from_secs(15);

/// BEP 10 extension handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ExtensionHandshake {
    #[serde(default)]
    pub m: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl ExtensionHandshake {
    /// Our handshake: `ut_metadata` support plus the metadata size once known.
    pub fn ours(metadata_size: Option<usize>) -> Self {
        Self {
            m: BTreeMap::from([("ut_metadata".to_string(), i64::from(UT_METADATA_ID))]),
            metadata_size: metadata_size.map(|size| size as i64),
            v: Some(concat!("Tideway ", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }

    /// Message id the remote side wants for `ut_metadata`, if supported.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m
            .get("ut_metadata")
            .and_then(|&id| u8::try_from(id).ok())
            .filter(|&id| id != 0)
    }

    pub fn encode(&self) -> Result<Bytes, TorrentError> {
        serde_bencode::to_bytes(self)
            .map(Bytes::from)
            .map_err(|e| protocol_error(format!("encoding extension handshake: {e}")))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TorrentError> {
        serde_bencode::from_bytes(payload)
            .map_err(|e| protocol_error(format!("decoding extension handshake: {e}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawMetadataMessage {
    msg_type: i64,
    piece: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

/// `ut_metadata` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: usize, data: Bytes },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Result<Bytes, TorrentError> {
        let (raw, trailer) = match self {
            MetadataMessage::Request { piece } => (
                RawMetadataMessage {
                    msg_type: 0,
                    piece: i64::from(*piece),
                    total_size: None,
                },
                None,
            ),
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => (
                RawMetadataMessage {
                    msg_type: 1,
                    piece: i64::from(*piece),
                    total_size: Some(*total_size as i64),
                },
                Some(data),
            ),
            MetadataMessage::Reject { piece } => (
                RawMetadataMessage {
                    msg_type: 2,
                    piece: i64::from(*piece),
                    total_size: None,
                },
                None,
            ),
        };

        let mut encoded = serde_bencode::to_bytes(&raw)
            .map_err(|e| protocol_error(format!("encoding metadata message: {e}")))?;
        if let Some(data) = trailer {
            encoded.extend_from_slice(data);
        }
        Ok(Bytes::from(encoded))
    }

    /// Splits the bencoded header from the raw piece data that follows it.
    pub fn decode(payload: Bytes) -> Result<Self, TorrentError> {
        let header_end = bencode::element_end(&payload, 0)
            .map_err(|e| protocol_error(format!("metadata message header: {e}")))?;
        let raw: RawMetadataMessage = serde_bencode::from_bytes(&payload[..header_end])
            .map_err(|e| protocol_error(format!("decoding metadata message: {e}")))?;
        let piece =
            u32::try_from(raw.piece).map_err(|_| protocol_error("negative metadata piece".into()))?;

        match raw.msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => Ok(MetadataMessage::Data {
                piece,
                total_size: raw
                    .total_size
                    .and_then(|size| usize::try_from(size).ok())
                    .ok_or_else(|| protocol_error("metadata data without total_size".into()))?,
                data: payload.slice(header_end..),
            }),
            2 => Ok(MetadataMessage::Reject { piece }),
            other => Err(protocol_error(format!("unknown metadata msg_type {other}"))),
        }
    }
}

/// Collects metadata pieces from peers and verifies them against the info-hash.
#[derive(Debug)]
pub(crate) struct MetadataAssembly {
    info_hash: InfoHash,
    size: Option<usize>,
    pieces: Vec<Option<Bytes>>,
    requested: Vec<Option<Instant>>,
}

impl MetadataAssembly {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            size: None,
            pieces: Vec::new(),
            requested: Vec::new(),
        }
    }

    /// Adopts the first plausible size a peer advertises.
    pub fn set_size(&mut self, size: usize) {
        if self.size.is_some() || size == 0 || size > MAX_METADATA_LEN {
            return;
        }
        let count = size.div_ceil(METADATA_PIECE_LEN);
        self.size = Some(size);
        self.pieces = vec![None; count];
        self.requested = vec![None; count];
    }

    /// Next piece nobody is fetching, or whose request went unanswered too long.
    pub fn next_request(&mut self, now: Instant) -> Option<u32> {
        let index = self.pieces.iter().enumerate().position(|(index, piece)| {
            piece.is_none()
                && self.requested[index].is_none_or(|at| now.duration_since(at) > REQUEST_RETRY)
        })?;
        self.requested[index] = Some(now);
        Some(index as u32)
    }

    pub fn reject(&mut self, piece: u32) {
        if let Some(slot) = self.requested.get_mut(piece as usize) {
            *slot = None;
        }
    }

    /// Stores a piece; returns the full dictionary once every piece arrived
    /// and the hash matches. A mismatch discards everything collected.
    pub fn receive(&mut self, piece: u32, total_size: usize, data: Bytes) -> Option<Vec<u8>> {
        self.set_size(total_size);
        let size = self.size?;
        let index = piece as usize;
        let expected_len = size.saturating_sub(index * METADATA_PIECE_LEN).min(METADATA_PIECE_LEN);
        if index >= self.pieces.len() || data.len() != expected_len {
            self.reject(piece);
            return None;
        }

        self.pieces[index] = Some(data);
        if self.pieces.iter().any(Option::is_none) {
            return None;
        }

        let assembled: Vec<u8> = self.pieces.iter().flatten().flat_map(|p| p.iter().copied()).collect();
        if Sha1::digest(&assembled).as_slice() == self.info_hash.as_bytes() {
            Some(assembled)
        } else {
            tracing::warn!("Metadata for {} failed hash check, starting over", self.info_hash);
            self.pieces.iter_mut().for_each(|p| *p = None);
            self.requested.iter_mut().for_each(|r| *r = None);
            None
        }
    }
}

fn protocol_error(message: String) -> TorrentError {
    TorrentError::ProtocolError { message }
}
