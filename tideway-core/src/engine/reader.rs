//! Blocking reader over a torrent's byte space

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Instant;

use super::pieces::WaitError;
use super::torrent::TorrentState;
use super::{PiecePriority, TorrentReader};
use crate::torrent::PieceIndex;

/// Reads torrent bytes in order, parking until each piece is verified.
///
/// Every read raises the pieces just ahead of the position to high priority
/// so sequential consumers rarely wait.
pub(crate) struct SwarmReader {
    state: Arc<TorrentState>,
    position: u64,
}

impl SwarmReader {
    pub fn new(state: Arc<TorrentState>) -> Self {
        Self { state, position: 0 }
    }
}

impl Read for SwarmReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(loaded) = self.state.loaded() else {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "torrent metadata not available yet",
            ));
        };

        let total = loaded.info.total_length;
        if buf.is_empty() || self.position >= total {
            return Ok(0);
        }

        let piece_length = loaded.info.piece_length;
        let piece = (self.position / piece_length) as usize;
        let readahead = self.state.context.engine.readahead_pieces as u64;
        let window_end = (self.position + readahead * piece_length).min(total);
        self.state
            .prioritize_bytes(self.position..window_end.max(self.position + 1), PiecePriority::High);
        if !loaded.pieces.is_complete(piece) {
            self.state
                .prioritize_bytes(self.position..self.position + 1, PiecePriority::Now);
        }

        let deadline = self.state.context.read_timeout.map(|timeout| Instant::now() + timeout);
        loaded.pieces.wait_for(piece, deadline).map_err(|e| match e {
            WaitError::TimedOut => io::Error::new(io::ErrorKind::TimedOut, e),
            WaitError::Closed => io::Error::new(io::ErrorKind::ConnectionAborted, e),
            WaitError::OutOfRange => io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let piece_end = loaded.info.piece_offset(PieceIndex::new(piece as u32))
            + loaded.info.piece_size(PieceIndex::new(piece as u32));
        let count = (buf.len() as u64).min(piece_end - self.position) as usize;
        loaded
            .storage
            .read_at(self.position, &mut buf[..count])
            .map_err(io::Error::other)?;

        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for SwarmReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let total = self
                    .state
                    .loaded()
                    .map(|loaded| loaded.info.total_length)
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::WouldBlock, "torrent length not known yet")
                    })?;
                total.checked_add_signed(delta)
            }
        };

        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        self.position = target;
        Ok(target)
    }
}

impl TorrentReader for SwarmReader {
    fn position(&self) -> u64 {
        self.position
    }
}
