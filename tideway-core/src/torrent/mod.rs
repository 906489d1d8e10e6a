//! Torrent identity, descriptors and locator resolution

pub mod info;
pub mod parsing;
pub mod resolver;
pub mod seeds;
pub mod spec;

use std::fmt;

pub use info::{FileEntry, TorrentInfo};
pub use parsing::{MagnetLink, Metainfo};
pub use resolver::{ResolveError, SpecResolver};
pub use seeds::{SeedAddress, SeedError, default_seed_addresses, resolve_seed_addresses};
pub use spec::TorrentSpec;

/// SHA-1 of a torrent's bencoded info dictionary.
///
/// Displays as 40 lowercase hex characters, the form used in status
/// output, magnet links and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Raw digest as sent in handshakes and announces.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses the 40-character hexadecimal form.
    ///
    /// # Errors
    /// - `TorrentError::InvalidInfoHash` - Wrong length or non-hex characters
    pub fn from_hex(text: &str) -> Result<Self, TorrentError> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(text, &mut hash).map_err(|e| TorrentError::InvalidInfoHash {
            reason: format!("{text}: {e}"),
        })?;
        Ok(Self(hash))
    }

    /// Parses the 32-character RFC 4648 base32 form used by older magnet links.
    ///
    /// # Errors
    /// - `TorrentError::InvalidInfoHash` - Wrong length or characters outside the base32 alphabet
    pub fn from_base32(text: &str) -> Result<Self, TorrentError> {
        if text.len() != 32 {
            return Err(TorrentError::InvalidInfoHash {
                reason: format!("{text}: expected 32 base32 characters"),
            });
        }

        let mut hash = [0u8; 20];
        let mut buffer: u64 = 0;
        let mut bits = 0u32;
        let mut written = 0usize;

        for character in text.bytes() {
            let value = match character.to_ascii_uppercase() {
                c @ b'A'..=b'Z' => c - b'A',
                c @ b'2'..=b'7' => c - b'2' + 26,
                _ => {
                    return Err(TorrentError::InvalidInfoHash {
                        reason: format!("{text}: invalid base32 character"),
                    });
                }
            };
            buffer = (buffer << 5) | u64::from(value);
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                hash[written] = (buffer >> bits) as u8;
                written += 1;
            }
        }

        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Piece number as carried in wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into per-piece tables.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur while decoding torrents or talking to the swarm.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid magnet link: {reason}")]
    InvalidMagnet { reason: String },

    #[error("Invalid info hash: {reason}")]
    InvalidInfoHash { reason: String },

    #[error("Tracker {url} failed: {reason}")]
    TrackerFailed { url: String, reason: String },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trips_through_hex() {
        let mut digest = [0u8; 20];
        digest.iter_mut().enumerate().for_each(|(i, b)| *b = (i * 13) as u8);
        let hash = InfoHash::new(digest);

        let text = hash.to_string();
        assert_eq!(text.len(), 40);
        assert!(text.starts_with("000d1a27"));
        assert_eq!(InfoHash::from_hex(&text).unwrap(), hash);
    }

    #[test]
    fn test_info_hash_from_hex_accepts_both_cases() {
        let lower = InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
        let upper = InfoHash::from_hex("0123456789ABCDEF0123456789ABCDEF01234567").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.as_bytes()[1], 0x23);
    }

    #[test]
    fn test_info_hash_from_hex_rejects_short_input() {
        assert!(matches!(
            InfoHash::from_hex("0123"),
            Err(TorrentError::InvalidInfoHash { .. })
        ));
    }

    #[test]
    fn test_info_hash_from_base32_matches_hex() {
        // 20 bytes of 0xff encode to 32 '7' characters
        let from_base32 = InfoHash::from_base32(&"7".repeat(32)).unwrap();
        assert_eq!(from_base32, InfoHash::new([0xff; 20]));

        let zeros = InfoHash::from_base32(&"a".repeat(32)).unwrap();
        assert_eq!(zeros, InfoHash::new([0; 20]));
    }

    #[test]
    fn test_info_hash_from_base32_rejects_invalid_alphabet() {
        assert!(InfoHash::from_base32(&"1".repeat(32)).is_err());
        assert!(InfoHash::from_base32("ABC").is_err());
    }

    #[test]
    fn test_hash_mismatch_names_the_piece() {
        let error = TorrentError::PieceHashMismatch {
            index: PieceIndex::new(42),
        };
        assert_eq!(error.to_string(), "Piece 42 hash mismatch");
    }
}
