//! Status snapshot served at `/`

use serde::Serialize;
use tideway_core::{FileHandle, PieceState, TorrentHandle};

/// Whether torrent metadata is known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    Pending,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileStatus {
    pub path: String,
    pub length: u64,
    /// Fraction of the file's pieces that are verified, in `[0.0, 1.0]`
    pub complete: f32,
}

/// Point-in-time view of the proxied torrent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentStatus {
    pub status: Readiness,
    /// Info-hash as 40 hex characters
    pub id: String,
    pub name: String,
    pub files: Vec<FileStatus>,
}

impl TorrentStatus {
    /// Reads the current state of `torrent`. Nothing is cached.
    pub fn snapshot(torrent: &dyn TorrentHandle) -> Self {
        let status = if torrent.info().is_some() {
            Readiness::Ready
        } else {
            Readiness::Pending
        };

        Self {
            status,
            id: torrent.info_hash().to_string(),
            name: torrent.name(),
            files: torrent.files().iter().map(|file| file_status(file.as_ref())).collect(),
        }
    }
}

fn file_status(file: &dyn FileHandle) -> FileStatus {
    FileStatus {
        path: file.path(),
        length: file.length(),
        complete: completion(&file.piece_states()),
    }
}

/// Complete pieces over total pieces; no pieces counts as `0.0`.
pub fn completion(pieces: &[PieceState]) -> f32 {
    if pieces.is_empty() {
        return 0.0;
    }
    let complete = pieces.iter().filter(|p| p.complete).count();
    complete as f32 / pieces.len() as f32
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tideway_core::InfoHash;
    use tideway_core::fixtures::{MemoryTorrent, TorrentBuilder};

    use super::*;

    #[test]
    fn test_pending_snapshot() {
        let torrent = MemoryTorrent::pending(InfoHash::new([0xab; 20]), "coming soon");
        let status = TorrentStatus::snapshot(torrent.as_ref());

        assert_eq!(status.status, Readiness::Pending);
        assert_eq!(status.id, "ab".repeat(20));
        assert_eq!(status.name, "coming soon");
        assert!(status.files.is_empty());
    }

    #[test]
    fn test_ready_snapshot_tracks_live_completion() {
        let fixture = TorrentBuilder::new("album")
            .file("a.txt", 64)
            .file("b.txt", 32)
            .piece_length(32)
            .build();
        let torrent = MemoryTorrent::new(&fixture);

        let before = TorrentStatus::snapshot(torrent.as_ref());
        assert_eq!(before.status, Readiness::Ready);
        assert_eq!(before.files[0].complete, 0.0);

        torrent.complete_piece(0);
        let after = TorrentStatus::snapshot(torrent.as_ref());
        assert_eq!(after.files[0].complete, 0.5);
        assert_eq!(after.files[1].complete, 0.0);
    }

    #[test]
    fn test_json_shape() {
        let fixture = TorrentBuilder::single("clip.mp4", 10).build();
        let torrent = MemoryTorrent::new(&fixture);
        torrent.complete_all();

        let json = serde_json::to_value(TorrentStatus::snapshot(torrent.as_ref())).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["id"], fixture.info_hash.to_string());
        assert_eq!(json["name"], "clip.mp4");
        assert_eq!(json["files"][0]["path"], "clip.mp4");
        assert_eq!(json["files"][0]["length"], 10);
        assert_eq!(json["files"][0]["complete"], 1.0);
    }

    #[test]
    fn test_no_pieces_is_zero() {
        assert_eq!(completion(&[]), 0.0);
    }

    proptest! {
        #[test]
        fn prop_completion_is_a_fraction(flags in proptest::collection::vec(any::<bool>(), 0..200)) {
            let pieces: Vec<PieceState> = flags
                .iter()
                .map(|&complete| PieceState { complete, ..PieceState::default() })
                .collect();
            let value = completion(&pieces);
            prop_assert!((0.0..=1.0).contains(&value));
            if !flags.contains(&true) {
                prop_assert_eq!(value, 0.0);
            }
        }
    }
}
