//! TCP transport for peer sessions: handshake exchange and length-prefixed framing

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::wire::{HANDSHAKE_LEN, Handshake, MAX_FRAME_LEN, Message};
use crate::torrent::TorrentError;

/// Connects to `address` and exchanges handshakes.
///
/// # Errors
/// - `TorrentError::PeerConnectionError` - Connect failed or timed out
/// - `TorrentError::ProtocolError` - Peer answered for a different torrent
pub(crate) async fn connect(
    address: SocketAddr,
    ours: &Handshake,
    timeout: Duration,
) -> Result<(TcpStream, Handshake), TorrentError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| TorrentError::PeerConnectionError {
            reason: format!("Timed out connecting to {address}"),
        })?
        .map_err(|e| TorrentError::PeerConnectionError {
            reason: format!("Failed to connect to {address}: {e}"),
        })?;

    stream.write_all(&ours.encode()).await?;
    let theirs = read_handshake(&mut stream, timeout).await?;
    if theirs.info_hash != ours.info_hash {
        return Err(TorrentError::ProtocolError {
            message: "Info hash mismatch in handshake".to_string(),
        });
    }

    Ok((stream, theirs))
}

/// Reads the remote handshake, waiting at most `timeout`.
///
/// # Errors
/// - `TorrentError::PeerConnectionError` - Timed out or connection dropped
/// - `TorrentError::ProtocolError` - Not a BitTorrent handshake
pub(crate) async fn read_handshake(
    stream: &mut TcpStream,
    timeout: Duration,
) -> Result<Handshake, TorrentError> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    tokio::time::timeout(timeout, stream.read_exact(&mut buf))
        .await
        .map_err(|_| TorrentError::PeerConnectionError {
            reason: "Timed out waiting for handshake".to_string(),
        })?
        .map_err(|e| TorrentError::PeerConnectionError {
            reason: format!("Failed to read handshake: {e}"),
        })?;
    Handshake::decode(&buf)
}

/// Splits an established connection into framed halves.
pub(crate) fn split(stream: TcpStream) -> (MessageReader, MessageWriter) {
    let (read, write) = stream.into_split();
    (MessageReader { half: read }, MessageWriter { half: write })
}

pub(crate) struct MessageReader {
    half: OwnedReadHalf,
}

impl MessageReader {
    /// Reads the next complete frame. Not cancel-safe.
    pub async fn next(&mut self) -> Result<Message, TorrentError> {
        let length = self
            .half
            .read_u32()
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read message length: {e}"),
            })?;

        if length > MAX_FRAME_LEN {
            return Err(TorrentError::ProtocolError {
                message: format!("Frame of {length} bytes exceeds limit"),
            });
        }

        let mut frame = vec![0u8; length as usize];
        self.half
            .read_exact(&mut frame)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read message payload: {e}"),
            })?;

        Message::decode(Bytes::from(frame))
    }
}

pub(crate) struct MessageWriter {
    half: OwnedWriteHalf,
}

impl MessageWriter {
    pub async fn send(&mut self, message: &Message) -> Result<(), TorrentError> {
        self.half
            .write_all(&message.encode())
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to send message: {e}"),
            })
    }
}
