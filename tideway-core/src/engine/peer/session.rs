//! One connected peer: interest, requests, uploads and metadata exchange

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use super::connection::{self, MessageWriter};
use super::wire::{Handshake, Message};
use crate::engine::metadata::{
    ExtensionHandshake, METADATA_PIECE_LEN, MetadataMessage, UT_METADATA_ID,
};
use crate::engine::torrent::TorrentState;
use crate::torrent::{PieceIndex, TorrentError};

const MAX_UPLOAD_BLOCK: u32 = 128 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);
const PIECE_STALL_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Drives a handshaken connection until either side hangs up or the torrent closes.
pub(crate) async fn run(
    state: Arc<TorrentState>,
    stream: TcpStream,
    remote: Handshake,
    address: SocketAddr,
) {
    let (mut reader, mut writer) = connection::split(stream);
    let (inbox_tx, mut inbox) = mpsc::channel(64);
    let reader_task = tokio::spawn(async move {
        loop {
            let message = reader.next().await;
            let failed = message.is_err();
            if inbox_tx.send(message).await.is_err() || failed {
                break;
            }
        }
    });

    tracing::debug!("Connected to peer {} for {}", address, state.info_hash);
    let mut session = PeerSession::new(state, address, remote.supports_extensions());
    let result = session.run(&mut writer, &mut inbox).await;
    reader_task.abort();
    session.release_download();

    match result {
        Ok(()) => tracing::debug!("Session with {} ended", address),
        Err(e) => tracing::debug!("Peer {} disconnected: {}", address, e),
    }
}

/// Pieces a peer claims to have. Grows on demand because a bitfield may
/// arrive before we know the piece count.
#[derive(Debug, Default)]
struct PeerPieces {
    bits: Vec<u8>,
}

impl PeerPieces {
    fn has(&self, index: usize) -> bool {
        self.bits
            .get(index / 8)
            .is_some_and(|byte| byte & (0x80 >> (index % 8)) != 0)
    }

    fn set(&mut self, index: usize) {
        if self.bits.len() <= index / 8 {
            self.bits.resize(index / 8 + 1, 0);
        }
        self.bits[index / 8] |= 0x80 >> (index % 8);
    }
}

/// Piece currently being fetched from this peer.
#[derive(Debug)]
struct PieceDownload {
    index: usize,
    buffer: Vec<u8>,
    received: Vec<bool>,
    next_block: usize,
    in_flight: usize,
    block_size: u32,
    last_progress: Instant,
}

impl PieceDownload {
    fn new(index: usize, length: u64, block_size: u32) -> Self {
        let blocks = length.div_ceil(u64::from(block_size)) as usize;
        Self {
            index,
            buffer: vec![0; length as usize],
            received: vec![false; blocks],
            next_block: 0,
            in_flight: 0,
            block_size,
            last_progress: Instant::now(),
        }
    }

    fn block_span(&self, block: usize) -> (u32, u32) {
        let offset = block as u32 * self.block_size;
        let length = (self.buffer.len() as u32 - offset).min(self.block_size);
        (offset, length)
    }

    fn is_done(&self) -> bool {
        self.received.iter().all(|&r| r)
    }
}

struct PeerSession {
    state: Arc<TorrentState>,
    address: SocketAddr,
    extensions: bool,
    peer_choking: bool,
    am_choking: bool,
    am_interested: bool,
    peer_pieces: PeerPieces,
    remote_metadata_id: Option<u8>,
    metadata_requested: Option<Instant>,
    download: Option<PieceDownload>,
    last_received: Instant,
    last_sent: Instant,
}

impl PeerSession {
    fn new(state: Arc<TorrentState>, address: SocketAddr, extensions: bool) -> Self {
        Self {
            state,
            address,
            extensions,
            peer_choking: true,
            am_choking: true,
            am_interested: false,
            peer_pieces: PeerPieces::default(),
            remote_metadata_id: None,
            metadata_requested: None,
            download: None,
            last_received: Instant::now(),
            last_sent: Instant::now(),
        }
    }

    async fn run(
        &mut self,
        writer: &mut MessageWriter,
        inbox: &mut mpsc::Receiver<Result<Message, TorrentError>>,
    ) -> Result<(), TorrentError> {
        let mut shutdown = self.state.shutdown_signal();
        let mut completed = self.state.subscribe_completed();
        if *shutdown.borrow() {
            return Ok(());
        }

        if self.extensions {
            let metadata_size = self.state.loaded().map(|loaded| loaded.info.raw.len());
            let payload = ExtensionHandshake::ours(metadata_size).encode()?;
            self.send(writer, Message::Extended { id: 0, payload }).await?;
        }
        if let Some(loaded) = self.state.loaded()
            && loaded.pieces.completed() > 0
        {
            let bitfield = Bytes::from(loaded.pieces.bitfield());
            self.send(writer, Message::Bitfield { bitfield }).await?;
        }

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(Ok(message)) => {
                        self.last_received = Instant::now();
                        self.handle(writer, message).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                piece = completed.recv() => match piece {
                    Ok(index) => {
                        let piece_index = PieceIndex::new(index);
                        self.send(writer, Message::Have { piece_index }).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = self.state.wanted.notified() => {}
                _ = tick.tick() => self.check_timers(writer).await?,
                _ = shutdown.changed() => return Ok(()),
            }

            self.update_interest(writer).await?;
            self.request_blocks(writer).await?;
            self.request_metadata(writer).await?;
        }
    }

    async fn send(&mut self, writer: &mut MessageWriter, message: Message) -> Result<(), TorrentError> {
        tracing::trace!("-> {} {:?}", self.address, MessageKind(&message));
        writer.send(&message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn handle(&mut self, writer: &mut MessageWriter, message: Message) -> Result<(), TorrentError> {
        tracing::trace!("<- {} {:?}", self.address, MessageKind(&message));
        match message {
            Message::KeepAlive | Message::Cancel { .. } | Message::Port { .. } => {}
            Message::Choke => {
                self.peer_choking = true;
                self.release_download();
            }
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => {
                if self.am_choking {
                    self.am_choking = false;
                    self.send(writer, Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {}
            Message::Have { piece_index } => self.peer_pieces.set(piece_index.as_usize()),
            Message::Bitfield { bitfield } => {
                self.peer_pieces = PeerPieces {
                    bits: bitfield.to_vec(),
                }
            }
            Message::Request {
                piece_index,
                offset,
                length,
            } => self.serve_block(writer, piece_index, offset, length).await?,
            Message::Piece {
                piece_index,
                offset,
                data,
            } => self.receive_block(piece_index, offset, data).await?,
            Message::Extended { id: 0, payload } => match ExtensionHandshake::decode(&payload) {
                Ok(handshake) => {
                    self.remote_metadata_id = handshake.ut_metadata_id();
                    if let Some(size) = handshake.metadata_size.and_then(|s| usize::try_from(s).ok()) {
                        self.state.metadata_size_hint(size);
                    }
                }
                Err(e) => tracing::debug!("Ignoring extension handshake from {}: {}", self.address, e),
            },
            Message::Extended {
                id: UT_METADATA_ID,
                payload,
            } => self.handle_metadata(writer, MetadataMessage::decode(payload)?).await?,
            Message::Extended { id, .. } => {
                tracing::trace!("Ignoring extension message {} from {}", id, self.address);
            }
        }
        Ok(())
    }

    async fn serve_block(
        &mut self,
        writer: &mut MessageWriter,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        let Some(loaded) = self.state.loaded() else {
            return Ok(());
        };
        if self.am_choking
            || length > MAX_UPLOAD_BLOCK
            || !loaded.pieces.is_complete(piece_index.as_usize())
            || u64::from(offset) + u64::from(length) > loaded.info.piece_size(piece_index)
        {
            return Ok(());
        }

        let state = self.state.clone();
        let data = tokio::task::spawn_blocking(move || {
            let loaded = state.loaded().ok_or_else(|| TorrentError::ProtocolError {
                message: "metadata disappeared".to_string(),
            })?;
            let mut block = vec![0u8; length as usize];
            let start = loaded.info.piece_offset(piece_index) + u64::from(offset);
            loaded
                .storage
                .read_at(start, &mut block)
                .map_err(|e| TorrentError::ProtocolError {
                    message: format!("reading block for upload: {e}"),
                })?;
            Ok::<_, TorrentError>(block)
        })
        .await
        .map_err(|e| TorrentError::ProtocolError {
            message: format!("upload task failed: {e}"),
        })??;

        self.state
            .uploaded
            .fetch_add(u64::from(length), Ordering::Relaxed);
        self.send(
            writer,
            Message::Piece {
                piece_index,
                offset,
                data: Bytes::from(data),
            },
        )
        .await
    }

    async fn receive_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<(), TorrentError> {
        let Some(download) = self.download.as_mut() else {
            return Ok(());
        };
        if download.index != piece_index.as_usize() || offset % download.block_size != 0 {
            return Ok(());
        }

        let block = (offset / download.block_size) as usize;
        if block >= download.received.len() || download.received[block] {
            return Ok(());
        }
        let (start, length) = download.block_span(block);
        if data.len() != length as usize {
            return Err(TorrentError::ProtocolError {
                message: format!("block of {} bytes, expected {}", data.len(), length),
            });
        }

        let start = start as usize;
        download.buffer[start..start + data.len()].copy_from_slice(&data);
        download.received[block] = true;
        download.in_flight = download.in_flight.saturating_sub(1);
        download.last_progress = Instant::now();
        self.state
            .downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        if download.is_done()
            && let Some(finished) = self.download.take()
        {
            self.store_piece(finished).await?;
        }
        Ok(())
    }

    async fn store_piece(&mut self, download: PieceDownload) -> Result<(), TorrentError> {
        let index = download.index;
        let state = self.state.clone();
        let verified = tokio::task::spawn_blocking(move || {
            let Some(loaded) = state.loaded() else {
                return Ok(false);
            };
            let expected = loaded.info.piece_hashes.get(index).copied();
            if expected.as_ref().map(|h| h.as_slice()) != Some(Sha1::digest(&download.buffer).as_slice()) {
                return Ok(false);
            }
            let offset = loaded.info.piece_offset(PieceIndex::new(index as u32));
            loaded.storage.write_at(offset, &download.buffer)?;
            Ok::<_, crate::engine::StorageError>(true)
        })
        .await
        .map_err(|e| TorrentError::ProtocolError {
            message: format!("piece write task failed: {e}"),
        })?;

        match verified {
            Ok(true) => {
                tracing::debug!("Piece {} of {} complete from {}", index, self.state.info_hash, self.address);
                self.state.piece_completed(index);
                Ok(())
            }
            Ok(false) => {
                if let Some(loaded) = self.state.loaded() {
                    loaded.pieces.release(index);
                }
                Err(TorrentError::PieceHashMismatch {
                    index: PieceIndex::new(index as u32),
                })
            }
            Err(e) => {
                if let Some(loaded) = self.state.loaded() {
                    loaded.pieces.release(index);
                }
                tracing::warn!("Failed to store piece {} of {}: {}", index, self.state.info_hash, e);
                Err(TorrentError::ProtocolError {
                    message: format!("storing piece {index}: {e}"),
                })
            }
        }
    }

    async fn handle_metadata(
        &mut self,
        writer: &mut MessageWriter,
        message: MetadataMessage,
    ) -> Result<(), TorrentError> {
        match message {
            MetadataMessage::Request { piece } => {
                let Some(remote_id) = self.remote_metadata_id else {
                    return Ok(());
                };
                let reply = match self.state.loaded() {
                    Some(loaded) => {
                        let raw = &loaded.info.raw;
                        let start = piece as usize * METADATA_PIECE_LEN;
                        if start < raw.len() {
                            let end = (start + METADATA_PIECE_LEN).min(raw.len());
                            MetadataMessage::Data {
                                piece,
                                total_size: raw.len(),
                                data: raw.slice(start..end),
                            }
                        } else {
                            MetadataMessage::Reject { piece }
                        }
                    }
                    None => MetadataMessage::Reject { piece },
                };
                let payload = reply.encode()?;
                self.send(writer, Message::Extended { id: remote_id, payload }).await?;
            }
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => {
                self.metadata_requested = None;
                self.state.metadata_received(piece, total_size, data);
            }
            MetadataMessage::Reject { piece } => {
                self.metadata_requested = None;
                self.state.metadata_rejected(piece);
                // Peer has no metadata to share
                self.remote_metadata_id = None;
            }
        }
        Ok(())
    }

    async fn update_interest(&mut self, writer: &mut MessageWriter) -> Result<(), TorrentError> {
        let wants = match self.state.loaded() {
            Some(loaded) => loaded.pieces.wants_any(|index| self.peer_pieces.has(index)),
            None => false,
        };
        if wants != self.am_interested {
            self.am_interested = wants;
            let message = if wants {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.send(writer, message).await?;
        }
        Ok(())
    }

    async fn request_blocks(&mut self, writer: &mut MessageWriter) -> Result<(), TorrentError> {
        if self.peer_choking || !self.am_interested {
            return Ok(());
        }
        let state = self.state.clone();
        let Some(loaded) = state.loaded() else {
            return Ok(());
        };

        if self.download.is_none()
            && let Some(index) = loaded.pieces.pick(|index| self.peer_pieces.has(index))
        {
            let length = loaded.info.piece_size(PieceIndex::new(index as u32));
            self.download = Some(PieceDownload::new(index, length, state.context.engine.block_size));
        }

        let pipeline = state.context.engine.request_pipeline;
        let mut requests = Vec::new();
        if let Some(download) = self.download.as_mut() {
            while download.in_flight < pipeline && download.next_block < download.received.len() {
                let (offset, length) = download.block_span(download.next_block);
                requests.push(Message::Request {
                    piece_index: PieceIndex::new(download.index as u32),
                    offset,
                    length,
                });
                download.next_block += 1;
                download.in_flight += 1;
            }
        }
        for request in requests {
            self.send(writer, request).await?;
        }
        Ok(())
    }

    async fn request_metadata(&mut self, writer: &mut MessageWriter) -> Result<(), TorrentError> {
        if self.state.loaded().is_some() {
            return Ok(());
        }
        let Some(remote_id) = self.remote_metadata_id else {
            return Ok(());
        };
        if self
            .metadata_requested
            .is_some_and(|at| at.elapsed() < METADATA_REQUEST_TIMEOUT)
        {
            return Ok(());
        }
        let Some(piece) = self.state.next_metadata_request() else {
            return Ok(());
        };

        self.metadata_requested = Some(Instant::now());
        let payload = MetadataMessage::Request { piece }.encode()?;
        self.send(writer, Message::Extended { id: remote_id, payload }).await
    }

    async fn check_timers(&mut self, writer: &mut MessageWriter) -> Result<(), TorrentError> {
        if self.last_received.elapsed() > self.state.context.network.peer_idle_timeout {
            return Err(TorrentError::PeerConnectionError {
                reason: "peer idle for too long".to_string(),
            });
        }
        if self
            .download
            .as_ref()
            .is_some_and(|d| d.last_progress.elapsed() > PIECE_STALL_TIMEOUT)
        {
            self.release_download();
            return Err(TorrentError::PeerConnectionError {
                reason: "piece download stalled".to_string(),
            });
        }
        if self.last_sent.elapsed() > KEEPALIVE_INTERVAL {
            self.send(writer, Message::KeepAlive).await?;
        }
        Ok(())
    }

    fn release_download(&mut self) {
        if let Some(download) = self.download.take()
            && let Some(loaded) = self.state.loaded()
        {
            loaded.pieces.release(download.index);
        }
    }
}

/// Logs message kinds without dumping block payloads.
struct MessageKind<'a>(&'a Message);

impl std::fmt::Debug for MessageKind<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Message::Piece {
                piece_index,
                offset,
                data,
            } => write!(f, "Piece({piece_index}, {offset}, {} bytes)", data.len()),
            Message::Bitfield { bitfield } => write!(f, "Bitfield({} bytes)", bitfield.len()),
            Message::Extended { id, payload } => write!(f, "Extended({id}, {} bytes)", payload.len()),
            other => write!(f, "{other:?}"),
        }
    }
}
