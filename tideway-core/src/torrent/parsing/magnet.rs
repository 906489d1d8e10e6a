//! Magnet link decoding (BEP 9 `magnet:?xt=urn:btih:...`)

use url::Url;

use crate::torrent::{InfoHash, TorrentError};

/// Parsed magnet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    /// Percent-decoded `dn` parameter
    pub display_name: Option<String>,
    /// `tr` parameters in order of appearance
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parses a magnet URI.
    ///
    /// The exact topic must be a BitTorrent info-hash in 40-character hex or
    /// 32-character base32 form. Unknown parameters are ignored.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnet` - Not a magnet URI or no usable `xt` parameter
    pub fn parse(uri: &str) -> Result<Self, TorrentError> {
        let url = Url::parse(uri).map_err(|e| TorrentError::InvalidMagnet {
            reason: e.to_string(),
        })?;
        Self::from_url(&url)
    }

    /// Same as [`MagnetLink::parse`] for an already parsed URL.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnet` - Scheme is not `magnet` or no usable `xt` parameter
    pub fn from_url(url: &Url) -> Result<Self, TorrentError> {
        if url.scheme() != "magnet" {
            return Err(TorrentError::InvalidMagnet {
                reason: format!("scheme '{}' is not magnet", url.scheme()),
            });
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(encoded) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(decode_topic(encoded)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| TorrentError::InvalidMagnet {
            reason: "missing urn:btih exact topic".to_string(),
        })?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }
}

fn decode_topic(encoded: &str) -> Result<InfoHash, TorrentError> {
    let decoded = match encoded.len() {
        40 => InfoHash::from_hex(encoded),
        32 => InfoHash::from_base32(encoded),
        other => {
            return Err(TorrentError::InvalidMagnet {
                reason: format!("info hash has {other} characters, expected 40 or 32"),
            });
        }
    };
    decoded.map_err(|e| TorrentError::InvalidMagnet {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_magnet_with_name_and_trackers() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HASH}&dn=Test%20Torrent&tr=http%3A%2F%2Ftracker.example.com%2Fannounce&tr=udp://t2:80"
        );
        let magnet = MagnetLink::parse(&uri).unwrap();

        assert_eq!(magnet.info_hash.to_string(), HASH);
        assert_eq!(magnet.display_name.as_deref(), Some("Test Torrent"));
        assert_eq!(
            magnet.trackers,
            vec!["http://tracker.example.com/announce", "udp://t2:80"]
        );
    }

    #[test]
    fn test_magnet_without_name() {
        let magnet = MagnetLink::parse(&format!("magnet:?xt=urn:btih:{HASH}")).unwrap();
        assert!(magnet.display_name.is_none());
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn test_magnet_with_base32_hash() {
        let uri = format!("magnet:?xt=urn:btih:{}", "7".repeat(32));
        let magnet = MagnetLink::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, InfoHash::new([0xff; 20]));
    }

    #[test]
    fn test_magnet_rejects_missing_topic() {
        assert!(matches!(
            MagnetLink::parse("magnet:?dn=nothing"),
            Err(TorrentError::InvalidMagnet { .. })
        ));
    }

    #[test]
    fn test_magnet_rejects_bad_hash() {
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:1234").is_err());
        assert!(MagnetLink::parse(&format!("magnet:?xt=urn:btih:{}", "z".repeat(40))).is_err());
    }

    #[test]
    fn test_non_magnet_scheme() {
        assert!(MagnetLink::parse("http://example.com/?xt=urn:btih:abc").is_err());
    }
}
