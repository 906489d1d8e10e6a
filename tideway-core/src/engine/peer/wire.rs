//! BitTorrent wire protocol framing (BEP 3) with the extension message (BEP 10)

use bytes::{Buf, BufMut, Bytes};

use crate::torrent::{InfoHash, PieceIndex, TorrentError};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Length of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 68;

/// Largest frame accepted from a peer: a 16 KiB block plus headroom.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

/// BitTorrent peer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Random peer ID carrying the client prefix, e.g. `-TW0001-`.
    pub fn generate(prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = prefix.as_bytes();
        let prefix_len = prefix.len().min(8);
        id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        for byte in &mut id[prefix_len..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// Initial exchange identifying torrent and peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Handshake advertising extension protocol support.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote side speaks BEP 10.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    /// # Errors
    /// - `TorrentError::ProtocolError` - Wrong protocol string
    pub fn decode(data: &[u8; HANDSHAKE_LEN]) -> Result<Self, TorrentError> {
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(TorrentError::ProtocolError {
                message: "Unknown protocol in handshake".to_string(),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}

/// Wire protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield {
        bitfield: Bytes,
    },
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    Port {
        port: u16,
    },
    /// BEP 10 message; id 0 is the extension handshake
    Extended {
        id: u8,
        payload: Bytes,
    },
}

impl Message {
    /// Serializes the message including its 4-byte length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::put_header(&mut buf, 0, 0),
            Message::Unchoke => Self::put_header(&mut buf, 1, 0),
            Message::Interested => Self::put_header(&mut buf, 2, 0),
            Message::NotInterested => Self::put_header(&mut buf, 3, 0),
            Message::Have { piece_index } => {
                Self::put_header(&mut buf, 4, 4);
                buf.put_u32(piece_index.as_u32());
            }
            Message::Bitfield { bitfield } => {
                Self::put_header(&mut buf, 5, bitfield.len());
                buf.extend_from_slice(bitfield);
            }
            Message::Request {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, 6, 12);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                Self::put_header(&mut buf, 7, 8 + data.len());
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            Message::Cancel {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, 8, 12);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::Port { port } => {
                Self::put_header(&mut buf, 9, 2);
                buf.put_u16(*port);
            }
            Message::Extended { id, payload } => {
                Self::put_header(&mut buf, 20, 1 + payload.len());
                buf.put_u8(*id);
                buf.extend_from_slice(payload);
            }
        }

        buf
    }

    /// Parses a frame body (everything after the length prefix).
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Unknown id or wrong body length
    pub fn decode(frame: Bytes) -> Result<Self, TorrentError> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let mut body = frame;
        let id = body.get_u8();
        let expect = |len: usize, body: &Bytes| {
            if body.len() == len {
                Ok(())
            } else {
                Err(TorrentError::ProtocolError {
                    message: format!("Message {id} has {} byte body, expected {len}", body.len()),
                })
            }
        };

        match id {
            0 => expect(0, &body).map(|_| Message::Choke),
            1 => expect(0, &body).map(|_| Message::Unchoke),
            2 => expect(0, &body).map(|_| Message::Interested),
            3 => expect(0, &body).map(|_| Message::NotInterested),
            4 => {
                expect(4, &body)?;
                Ok(Message::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                })
            }
            5 => Ok(Message::Bitfield { bitfield: body }),
            6 | 8 => {
                expect(12, &body)?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                Ok(if id == 6 {
                    Message::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    Message::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if body.len() < 8 {
                    return Err(TorrentError::ProtocolError {
                        message: "Piece message too short".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                Ok(Message::Piece {
                    piece_index,
                    offset,
                    data: body,
                })
            }
            9 => {
                expect(2, &body)?;
                Ok(Message::Port {
                    port: body.get_u16(),
                })
            }
            20 => {
                if body.is_empty() {
                    return Err(TorrentError::ProtocolError {
                        message: "Extended message without id".to_string(),
                    });
                }
                let id = body.get_u8();
                Ok(Message::Extended { id, payload: body })
            }
            _ => Err(TorrentError::ProtocolError {
                message: format!("Unknown message ID: {id}"),
            }),
        }
    }

    fn put_header(buf: &mut Vec<u8>, id: u8, body_len: usize) {
        buf.put_u32(1 + body_len as u32);
        buf.put_u8(id);
    }
}
