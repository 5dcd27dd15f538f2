//! Peer wire messages
//!
//! The fixed 68-byte handshake and the length-prefixed message framing of
//! BEP 3. Decoding validates payload sizes at the boundary: a malformed
//! length is a protocol error that closes the session, while an unknown
//! message id with a well-formed frame is passed through for the reader to
//! log and drop.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Protocol string for BitTorrent
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake message: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_SIZE: usize = 68;

/// Maximum accepted message size: a block plus framing headroom.
const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// The fixed-form connection preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Feature flags from the reserved bytes
    pub reserved: [u8; 8],
    /// Infohash of the requested torrent
    pub info_hash: Sha1Hash,
    /// Remote peer id
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build our outgoing handshake.
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize to the 68-byte wire form.
    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse and validate the 68-byte wire form.
    ///
    /// Rejects a wrong protocol string. The infohash is checked by the
    /// caller, which knows which torrent the connection belongs to.
    pub fn decode(buf: &[u8; HANDSHAKE_SIZE]) -> Result<Self> {
        if buf[0] as usize != PROTOCOL_STRING.len() || &buf[1..20] != PROTOCOL_STRING {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "invalid protocol string in handshake",
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// Peer wire protocol message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep connection alive (no id, no payload)
    KeepAlive,
    /// Stop servicing the peer's requests
    Choke,
    /// Resume servicing the peer's requests
    Unchoke,
    /// Interested in the peer's data
    Interested,
    /// Not interested in the peer's data
    NotInterested,
    /// Peer acquired a piece
    Have { piece_index: u32 },
    /// Full piece set, only valid directly after the handshake
    Bitfield { bitfield: Vec<u8> },
    /// Request a block
    Request { index: u32, begin: u32, length: u32 },
    /// Block data (response to a request)
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Withdraw a pending request
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT port (BEP 5) - decoded, then ignored by this engine
    Port { port: u16 },
    /// Well-formed frame with an id we do not recognize
    Unknown { id: u8, payload: Vec<u8> },
}

fn wire_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::PeerProtocol, message)
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

impl PeerMessage {
    /// Encode the message with its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { piece_index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&piece_index.to_be_bytes());
                buf
            }

            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Port { port } => {
                let mut buf = vec![0, 0, 0, 3, 9];
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }

            Self::Unknown { id, payload } => {
                let len = 1 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode a message body (length prefix already stripped).
    ///
    /// An empty body is a keepalive. Fixed-size payloads must match
    /// exactly; a wrong size is a protocol error.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = data[0];
        let payload = &data[1..];

        let expect_len = |len: usize| -> Result<()> {
            if payload.len() != len {
                Err(wire_error(format!(
                    "message id {} payload {} bytes, expected {}",
                    id,
                    payload.len(),
                    len
                )))
            } else {
                Ok(())
            }
        };

        match id {
            0 => {
                expect_len(0)?;
                Ok(Self::Choke)
            }
            1 => {
                expect_len(0)?;
                Ok(Self::Unchoke)
            }
            2 => {
                expect_len(0)?;
                Ok(Self::Interested)
            }
            3 => {
                expect_len(0)?;
                Ok(Self::NotInterested)
            }

            4 => {
                expect_len(4)?;
                Ok(Self::Have {
                    piece_index: read_u32(payload, 0),
                })
            }

            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),

            6 => {
                expect_len(12)?;
                Ok(Self::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }

            7 => {
                if payload.len() < 8 {
                    return Err(wire_error("piece message too short"));
                }
                Ok(Self::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    block: payload[8..].to_vec(),
                })
            }

            8 => {
                expect_len(12)?;
                Ok(Self::Cancel {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }

            9 => {
                expect_len(2)?;
                Ok(Self::Port {
                    port: u16::from_be_bytes([payload[0], payload[1]]),
                })
            }

            _ => Ok(Self::Unknown {
                id,
                payload: payload.to_vec(),
            }),
        }
    }
}

/// Read one framed message from the stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        EngineError::network(
            crate::error::NetworkErrorKind::ConnectionReset,
            format!("read failed: {}", e),
        )
    })?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(wire_error(format!("message too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        EngineError::network(
            crate::error::NetworkErrorKind::ConnectionReset,
            format!("read failed: {}", e),
        )
    })?;

    PeerMessage::decode(&body)
}

/// Write one framed message to the stream.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &PeerMessage,
) -> Result<()> {
    writer.write_all(&msg.encode()).await.map_err(|e| {
        EngineError::network(
            crate::error::NetworkErrorKind::ConnectionReset,
            format!("write failed: {}", e),
        )
    })
}
