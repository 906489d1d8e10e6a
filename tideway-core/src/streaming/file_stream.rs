//! One file of a torrent as a standard `Read + Seek` stream.
//!
//! Positions going in and out are file-relative. Internally the stream
//! drives a whole-torrent reader, so every position handed to it is the
//! file's offset plus the file-relative position, clamped to the file.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::engine::{FileHandle, TorrentReader};

/// Errors from [`FileStream::read_chunk`].
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// No bytes left in this file. A normal boundary, not a fault.
    #[error("End of file")]
    EndOfFile,

    #[error("Torrent read failed")]
    Io(#[from] io::Error),
}

/// Seekable stream over a single file inside a torrent.
///
/// Each read first hints the engine to fetch the exact file region about to
/// be read, then blocks on the torrent reader until the bytes are there.
pub struct FileStream {
    reader: Box<dyn TorrentReader>,
    file: Arc<dyn FileHandle>,
    offset: u64,
    length: u64,
}

impl FileStream {
    pub fn new(reader: Box<dyn TorrentReader>, file: Arc<dyn FileHandle>) -> Self {
        let offset = file.offset();
        let length = file.length();
        Self {
            reader,
            file,
            offset,
            length,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> String {
        self.file.path()
    }

    /// Current file-relative position.
    pub fn position(&self) -> u64 {
        self.reader.position().saturating_sub(self.offset)
    }

    fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Reads up to `buf.len()` bytes, never past the end of the file.
    ///
    /// A reader still positioned before this file (fresh, or left over from
    /// another scan) is moved to the file's first byte before reading.
    ///
    /// # Errors
    /// - `StreamError::EndOfFile` - Position is at or past the end of the file
    /// - `StreamError::Io` - Underlying torrent read failed or timed out
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if self.reader.position() < self.offset {
            self.reader.seek(SeekFrom::Start(self.offset))?;
        }

        let position = self.reader.position();
        let remaining = self.end().saturating_sub(position);
        let wanted = (buf.len() as u64).min(remaining) as usize;
        if wanted == 0 {
            return Err(StreamError::EndOfFile);
        }

        self.file
            .prioritize_region(position - self.offset, wanted as u64);

        let mut filled = 0;
        while filled < wanted {
            match self.reader.read(&mut buf[filled..wanted]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if filled > 0 => {
                    tracing::debug!("Short read on '{}': {}", self.file.path(), e);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.read_chunk(buf) {
            Ok(n) => Ok(n),
            Err(StreamError::EndOfFile) => Ok(0),
            Err(StreamError::Io(e)) => Err(e),
        }
    }
}

impl Seek for FileStream {
    /// Seeks within the file and returns the new file-relative position.
    ///
    /// `Start` clamps to the end of the file. `End` counts back from the
    /// end by the magnitude of the offset and clamps to the start of the
    /// file. `Current` is passed through to the torrent reader unchanged.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let end = self.end();
        let target = match pos {
            SeekFrom::Start(n) => SeekFrom::Start(self.offset.saturating_add(n).min(end)),
            SeekFrom::End(n) => SeekFrom::Start(end.saturating_sub(n.unsigned_abs()).max(self.offset)),
            SeekFrom::Current(n) => SeekFrom::Current(n),
        };

        let absolute = self.reader.seek(target)?;
        Ok(absolute.saturating_sub(self.offset))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::engine::TorrentHandle;
    use crate::fixtures::{MemoryTorrent, TorrentBuilder, TorrentFixture};

    fn two_files() -> TorrentFixture {
        TorrentBuilder::new("album")
            .file("one.bin", 100)
            .file("two.bin", 60)
            .piece_length(32)
            .build()
    }

    fn stream(torrent: &Arc<MemoryTorrent>, index: usize) -> FileStream {
        FileStream::new(torrent.new_reader(), torrent.files()[index].clone())
    }

    #[test]
    fn test_read_without_seek_starts_at_file() {
        let fixture = two_files();
        let torrent = MemoryTorrent::new(&fixture);
        let mut second = stream(&torrent, 1);

        let mut content = Vec::new();
        second.read_to_end(&mut content).unwrap();
        assert_eq!(content, fixture.file_content(1));
    }

    #[test]
    fn test_read_stops_at_file_end() {
        let fixture = two_files();
        let torrent = MemoryTorrent::new(&fixture);
        let mut first = stream(&torrent, 0);

        let mut buf = vec![0u8; 500];
        assert_eq!(first.read_chunk(&mut buf).unwrap(), 100);
        assert_eq!(&buf[..100], fixture.file_content(0));
        assert!(matches!(first.read_chunk(&mut buf), Err(StreamError::EndOfFile)));
    }

    #[test]
    fn test_seek_from_end_then_read_tail() {
        let fixture = two_files();
        let torrent = MemoryTorrent::new(&fixture);
        let mut first = stream(&torrent, 0);

        assert_eq!(first.seek(SeekFrom::End(10)).unwrap(), 90);
        let mut buf = vec![0u8; 64];
        assert_eq!(first.read_chunk(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], &fixture.file_content(0)[90..]);
        assert!(matches!(first.read_chunk(&mut buf), Err(StreamError::EndOfFile)));
    }

    #[test]
    fn test_negative_end_offset_counts_back_from_end() {
        let fixture = two_files();
        let torrent = MemoryTorrent::new(&fixture);
        let mut second = stream(&torrent, 1);
        assert_eq!(second.seek(SeekFrom::End(-10)).unwrap(), 50);
    }

    #[test]
    fn test_seek_bounds_for_offset_file() {
        let fixture = two_files();
        let torrent = MemoryTorrent::new(&fixture);
        let mut second = stream(&torrent, 1);

        assert_eq!(second.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert_eq!(second.seek(SeekFrom::End(0)).unwrap(), 60);
        assert_eq!(second.seek(SeekFrom::Start(1000)).unwrap(), 60);
        assert_eq!(second.seek(SeekFrom::End(1000)).unwrap(), 0);
    }

    #[test]
    fn test_current_seek_is_relative_to_live_position() {
        let fixture = two_files();
        let torrent = MemoryTorrent::new(&fixture);
        let mut second = stream(&torrent, 1);

        second.seek(SeekFrom::Start(20)).unwrap();
        assert_eq!(second.seek(SeekFrom::Current(5)).unwrap(), 25);
        assert_eq!(second.seek(SeekFrom::Current(-5)).unwrap(), 20);
        assert_eq!(second.position(), 20);
    }

    #[test]
    fn test_seek_does_not_prioritize() {
        let fixture = two_files();
        let torrent = MemoryTorrent::new(&fixture);
        let mut second = stream(&torrent, 1);

        second.seek(SeekFrom::Start(30)).unwrap();
        assert!(torrent.prioritized().is_empty());

        let mut buf = [0u8; 8];
        second.read_chunk(&mut buf).unwrap();
        assert_eq!(torrent.prioritized(), vec![(1, 30, 8)]);
    }

    #[test]
    fn test_short_underlying_reads_are_filled() {
        let fixture = two_files();
        let torrent = MemoryTorrent::with_max_read(&fixture, 7);
        let mut first = stream(&torrent, 0);

        let mut buf = [0u8; 40];
        assert_eq!(first.read_chunk(&mut buf).unwrap(), 40);
        assert_eq!(&buf[..], &fixture.file_content(0)[..40]);
    }

    #[test]
    fn test_separate_streams_do_not_share_position() {
        let fixture = two_files();
        let torrent = MemoryTorrent::new(&fixture);
        let mut a = stream(&torrent, 0);
        let mut b = stream(&torrent, 0);

        a.seek(SeekFrom::Start(50)).unwrap();
        assert_eq!(b.position(), 0);
        let mut buf = [0u8; 4];
        b.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf, &fixture.file_content(0)[..4]);
    }

    proptest! {
        #[test]
        fn prop_seek_stays_inside_file(
            first_len in 1u64..300,
            second_len in 1u64..300,
            start in 0u64..1000,
            back in -1000i64..1000,
        ) {
            let fixture = TorrentBuilder::new("t")
                .file("a", first_len)
                .file("b", second_len)
                .piece_length(64)
                .build();
            let torrent = MemoryTorrent::new(&fixture);

            for index in 0..2 {
                let length = fixture.info.files[index].length;
                let mut file = stream(&torrent, index);
                prop_assert_eq!(file.seek(SeekFrom::Start(start)).unwrap(), start.min(length));
                let from_end = file.seek(SeekFrom::End(back)).unwrap();
                prop_assert_eq!(from_end, length.saturating_sub(back.unsigned_abs()));
            }
        }

        #[test]
        fn prop_implicit_seek_matches_explicit_seek(chunk in 1usize..128) {
            let fixture = two_files();
            let torrent = MemoryTorrent::new(&fixture);

            let mut implicit = stream(&torrent, 1);
            let mut explicit = stream(&torrent, 1);
            explicit.seek(SeekFrom::Start(0)).unwrap();

            let mut a = Vec::new();
            let mut b = Vec::new();
            let mut buf = vec![0u8; chunk];
            while let Ok(n) = implicit.read_chunk(&mut buf) {
                a.extend_from_slice(&buf[..n]);
            }
            while let Ok(n) = explicit.read_chunk(&mut buf) {
                b.extend_from_slice(&buf[..n]);
            }
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.as_slice(), fixture.file_content(1));
        }
    }
}
