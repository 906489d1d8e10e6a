//! Decoded info dictionary: piece layout and file table

use std::ops::Range;

use bytes::Bytes;
use serde::Deserialize;
use sha1::{Digest, Sha1};

use super::{InfoHash, PieceIndex, TorrentError};

/// Single file inside a torrent.
///
/// `offset` is the position of the file's first byte in the torrent's
/// concatenated byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
    pub offset: u64,
}

impl FileEntry {
    /// Byte range occupied in the concatenated torrent data.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Everything the info dictionary says about a torrent's content.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
    /// `true` when the dictionary had a `files` list rather than a single `length`
    pub multi_file: bool,
    /// Bencoded info dictionary exactly as received, served to metadata requests
    pub raw: Bytes,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u64,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}

impl TorrentInfo {
    /// Decodes a bencoded info dictionary.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode, missing keys or inconsistent layout
    pub fn from_bytes(raw: &[u8]) -> Result<Self, TorrentError> {
        let decoded: RawInfo =
            serde_bencode::from_bytes(raw).map_err(|e| TorrentError::InvalidTorrentFile {
                reason: format!("info dictionary: {e}"),
            })?;

        if decoded.piece_length == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "piece length is zero".to_string(),
            });
        }
        if decoded.pieces.len() % 20 != 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "pieces field length {} is not a multiple of 20",
                    decoded.pieces.len()
                ),
            });
        }

        let (files, multi_file) = match (decoded.files, decoded.length) {
            (Some(list), _) => {
                let mut offset = 0;
                let mut files = Vec::with_capacity(list.len());
                for file in list {
                    if file.path.is_empty() {
                        return Err(TorrentError::InvalidTorrentFile {
                            reason: "file entry with empty path".to_string(),
                        });
                    }
                    files.push(FileEntry {
                        path: file.path,
                        length: file.length,
                        offset,
                    });
                    offset += file.length;
                }
                (files, true)
            }
            (None, Some(length)) => (
                vec![FileEntry {
                    path: vec![decoded.name.clone()],
                    length,
                    offset: 0,
                }],
                false,
            ),
            (None, None) => {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "info dictionary has neither length nor files".to_string(),
                });
            }
        };

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let piece_hashes: Vec<[u8; 20]> = decoded
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected_pieces = total_length.div_ceil(decoded.piece_length);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "{} piece hashes for {} bytes at piece length {}",
                    piece_hashes.len(),
                    total_length,
                    decoded.piece_length
                ),
            });
        }

        Ok(Self {
            name: decoded.name,
            piece_length: decoded.piece_length,
            piece_hashes,
            files,
            total_length,
            multi_file,
            raw: Bytes::copy_from_slice(raw),
        })
    }

    /// Info-hash of this dictionary.
    pub fn info_hash(&self) -> InfoHash {
        InfoHash::new(Sha1::digest(&self.raw).into())
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of one piece; the last piece may be shorter.
    pub fn piece_size(&self, index: PieceIndex) -> u64 {
        let start = u64::from(index.as_u32()) * self.piece_length;
        self.total_length.saturating_sub(start).min(self.piece_length)
    }

    /// Torrent byte offset of a piece's first byte.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * self.piece_length
    }

    /// Pieces that hold at least one byte of `range`.
    pub fn pieces_for_range(&self, range: Range<u64>) -> Range<usize> {
        if range.start >= range.end {
            return 0..0;
        }
        let first = range.start / self.piece_length;
        let last = (range.end - 1) / self.piece_length;
        first as usize..(last as usize + 1).min(self.piece_count())
    }

    /// Display path of a file: the torrent name for single-file torrents,
    /// the path components joined with `/` otherwise.
    pub fn display_path(&self, file: &FileEntry) -> String {
        if self.multi_file {
            file.path.join("/")
        } else {
            self.name.clone()
        }
    }
}
