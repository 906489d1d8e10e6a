//! On-disk layout of torrent data.
//!
//! Single-file torrents live at `<data_dir>/<name>`, multi-file torrents
//! under `<data_dir>/<name>/<path...>`. Reads and writes address the
//! torrent's concatenated byte space and are split across file boundaries.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::torrent::{PieceIndex, TorrentInfo};

/// Errors raised by torrent data storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Torrent file path would escape the data directory
    #[error("Unsafe path in torrent: {path}")]
    UnsafePath {
        /// Offending path as listed in the metadata
        path: String,
    },

    /// Access outside the torrent's byte space
    #[error("Range {start}..{end} outside torrent of {total} bytes")]
    OutOfRange {
        /// First byte requested
        start: u64,
        /// One past the last byte requested
        end: u64,
        /// Torrent size
        total: u64,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
struct StorageFile {
    path: PathBuf,
    offset: u64,
    length: u64,
}

/// Maps torrent offsets onto files under a data directory.
#[derive(Debug, Clone)]
pub struct TorrentStorage {
    files: Vec<StorageFile>,
    total_length: u64,
}

impl TorrentStorage {
    /// Lays out `info` under `data_dir`. No files are created yet.
    ///
    /// # Errors
    /// - `StorageError::UnsafePath` - A path component is absolute, `..` or empty
    pub fn new(data_dir: &Path, info: &TorrentInfo) -> Result<Self, StorageError> {
        let root = data_dir.join(checked_component(&info.name)?);

        let files = info
            .files
            .iter()
            .map(|file| {
                let path = if info.multi_file {
                    let mut path = root.clone();
                    for component in &file.path {
                        path.push(checked_component(component)?);
                    }
                    path
                } else {
                    root.clone()
                };
                Ok(StorageFile {
                    path,
                    offset: file.offset,
                    length: file.length,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(Self {
            files,
            total_length: info.total_length,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Fills `buf` with torrent bytes starting at `offset`.
    ///
    /// # Errors
    /// - `StorageError::OutOfRange` - Span extends past the torrent
    /// - `StorageError::Io` - A backing file is missing or too short
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        for (file, file_offset, span) in self.segments(offset, buf.len())? {
            let mut handle = File::open(&file.path)?;
            handle.seek(SeekFrom::Start(file_offset))?;
            handle.read_exact(&mut buf[span])?;
        }
        Ok(())
    }

    /// Writes `data` at torrent `offset`, creating directories and files as needed.
    ///
    /// # Errors
    /// - `StorageError::OutOfRange` - Span extends past the torrent
    /// - `StorageError::Io` - File system failure
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        for (file, file_offset, span) in self.segments(offset, data.len())? {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut handle = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file.path)?;
            handle.seek(SeekFrom::Start(file_offset))?;
            handle.write_all(&data[span])?;
        }
        Ok(())
    }

    /// Reads a whole piece.
    ///
    /// # Errors
    /// - `StorageError::Io` - Data not on disk
    pub fn read_piece(&self, info: &TorrentInfo, index: PieceIndex) -> Result<Vec<u8>, StorageError> {
        let mut piece = vec![0u8; info.piece_size(index) as usize];
        self.read_at(info.piece_offset(index), &mut piece)?;
        Ok(piece)
    }

    /// Hashes the data on disk for a piece against the metadata.
    ///
    /// Missing or short files count as unverified rather than as errors.
    ///
    /// # Errors
    /// - `StorageError::Io` - Unexpected file system failure
    pub fn verify_piece(&self, info: &TorrentInfo, index: PieceIndex) -> Result<bool, StorageError> {
        let Some(expected) = info.piece_hashes.get(index.as_usize()) else {
            return Ok(false);
        };
        match self.read_piece(info, index) {
            Ok(piece) => Ok(Sha1::digest(&piece).as_slice() == expected),
            Err(StorageError::Io(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::UnexpectedEof
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Splits a torrent span into (file, offset in file, range in buffer) parts.
    fn segments(
        &self,
        offset: u64,
        len: usize,
    ) -> Result<Vec<(&StorageFile, u64, Range<usize>)>, StorageError> {
        let end = offset + len as u64;
        if end > self.total_length {
            return Err(StorageError::OutOfRange {
                start: offset,
                end,
                total: self.total_length,
            });
        }

        Ok(self
            .files
            .iter()
            .filter(|file| file.length > 0)
            .filter_map(|file| {
                let start = offset.max(file.offset);
                let stop = end.min(file.offset + file.length);
                (start < stop).then(|| {
                    let buf_start = (start - offset) as usize;
                    let buf_end = (stop - offset) as usize;
                    (file, start - file.offset, buf_start..buf_end)
                })
            })
            .collect())
    }
}

fn checked_component(component: &str) -> Result<&str, StorageError> {
    let mut parts = Path::new(component).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) => Ok(component),
        _ => Err(StorageError::UnsafePath {
            path: component.to_string(),
        }),
    }
}
