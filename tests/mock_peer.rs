//! Mock BitTorrent peer
//!
//! A scriptable seeder for exercising the engine without real peers: it
//! accepts connections, answers the handshake, advertises a bitfield,
//! serves blocks (optionally corrupting one block exactly once), and
//! records the requests and cancels it receives.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Protocol string for the BitTorrent handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Mock peer behavior
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Info hash to accept connections for
    pub info_hash: [u8; 20],
    /// Our peer ID
    pub peer_id: [u8; 20],
    /// Number of pieces in the torrent
    pub num_pieces: usize,
    /// Piece payloads to serve
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Unchoke as soon as the connection is up
    pub auto_unchoke: bool,
    /// Serve this (piece, offset) corrupted, once
    pub corrupt_block: Option<(u32, u32)>,
    /// Delay before serving each block
    pub serve_delay: Option<Duration>,
}

impl MockPeerConfig {
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-MK0001-");
        for byte in peer_id.iter_mut().skip(8) {
            *byte = rand::random();
        }

        Self {
            info_hash,
            peer_id,
            num_pieces,
            piece_data: HashMap::new(),
            auto_unchoke: true,
            corrupt_block: None,
            serve_delay: None,
        }
    }

    /// Seed the full torrent.
    pub fn with_pieces(mut self, piece_data: &[Vec<u8>]) -> Self {
        for (i, data) in piece_data.iter().enumerate() {
            self.piece_data.insert(i as u32, data.clone());
        }
        self
    }

    /// Flip a bit in the given block the first time it is served.
    pub fn with_corrupt_block(mut self, piece: u32, offset: u32) -> Self {
        self.corrupt_block = Some((piece, offset));
        self
    }

    /// Slow the peer down to keep requests outstanding.
    pub fn with_serve_delay(mut self, delay: Duration) -> Self {
        self.serve_delay = Some(delay);
        self
    }
}

/// A mock peer listening for engine connections.
pub struct MockPeer {
    config: MockPeerConfig,
    listener: TcpListener,
    /// (piece, offset, length) of every REQUEST received
    requests: Arc<Mutex<Vec<(u32, u32, u32)>>>,
    /// (piece, offset, length) of every CANCEL received
    cancels: Arc<Mutex<Vec<(u32, u32, u32)>>>,
    corruption_spent: Arc<AtomicBool>,
}

impl MockPeer {
    pub async fn start(config: MockPeerConfig) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let peer = Arc::new(Self {
            config,
            listener,
            requests: Arc::new(Mutex::new(Vec::new())),
            cancels: Arc::new(Mutex::new(Vec::new())),
            corruption_spent: Arc::new(AtomicBool::new(false)),
        });

        let accept = Arc::clone(&peer);
        tokio::spawn(async move {
            loop {
                match accept.listener.accept().await {
                    Ok((stream, _)) => {
                        let conn = Arc::clone(&accept);
                        tokio::spawn(async move {
                            if let Err(e) = conn.handle_connection(stream).await {
                                tracing::debug!("mock peer connection ended: {}", e);
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(peer)
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<(u32, u32, u32)> {
        self.requests.lock().clone()
    }

    /// Cancels seen so far.
    pub fn cancels(&self) -> Vec<(u32, u32, u32)> {
        self.cancels.lock().clone()
    }

    /// Piece indices the engine requested from this peer.
    pub fn requested_pieces(&self) -> Vec<u32> {
        let mut pieces: Vec<u32> = self.requests.lock().iter().map(|r| r.0).collect();
        pieces.sort_unstable();
        pieces.dedup();
        pieces
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        // Handshake: read theirs, check the infohash, reply with ours.
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await?;

        if handshake[0] != 19 || &handshake[1..20] != PROTOCOL_STRING {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad protocol string",
            ));
        }
        if handshake[28..48] != self.config.info_hash {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "infohash mismatch",
            ));
        }

        let mut reply = Vec::with_capacity(68);
        reply.push(19);
        reply.extend_from_slice(PROTOCOL_STRING);
        reply.extend_from_slice(&[0u8; 8]);
        reply.extend_from_slice(&self.config.info_hash);
        reply.extend_from_slice(&self.config.peer_id);
        stream.write_all(&reply).await?;

        self.send_bitfield(&mut stream).await?;
        if self.config.auto_unchoke {
            stream.write_all(&[0, 0, 0, 1, 1]).await?; // unchoke
        }

        loop {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;

            if len == 0 {
                continue; // keepalive
            }

            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;

            let id = body[0];
            let payload = &body[1..];

            match id {
                // interested: unchoke if we were waiting for it
                2 if !self.config.auto_unchoke => {
                    stream.write_all(&[0, 0, 0, 1, 1]).await?;
                }

                // request
                6 if payload.len() == 12 => {
                    let piece = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                    let length = u32::from_be_bytes(payload[8..12].try_into().unwrap());
                    self.requests.lock().push((piece, offset, length));

                    if let Some(delay) = self.config.serve_delay {
                        tokio::time::sleep(delay).await;
                    }
                    self.serve_block(&mut stream, piece, offset, length).await?;
                }

                // cancel
                8 if payload.len() == 12 => {
                    let piece = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                    let length = u32::from_be_bytes(payload[8..12].try_into().unwrap());
                    self.cancels.lock().push((piece, offset, length));
                }

                _ => {}
            }
        }
    }

    async fn send_bitfield(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let num_bytes = self.config.num_pieces.div_ceil(8);
        let mut bitfield = vec![0u8; num_bytes];
        for piece in self.config.piece_data.keys() {
            let i = *piece as usize;
            if i < self.config.num_pieces {
                bitfield[i / 8] |= 0x80 >> (i % 8);
            }
        }

        let len = 1 + bitfield.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(5);
        msg.extend_from_slice(&bitfield);
        stream.write_all(&msg).await
    }

    async fn serve_block(
        &self,
        stream: &mut TcpStream,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> std::io::Result<()> {
        let Some(data) = self.config.piece_data.get(&piece) else {
            return Ok(()); // we do not have it; real peers just stay silent
        };
        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Ok(());
        }

        let mut block = data[start..end].to_vec();

        if self.config.corrupt_block == Some((piece, offset))
            && !self.corruption_spent.swap(true, Ordering::SeqCst)
        {
            let last = block.len() - 1;
            block[last] ^= 0x01;
        }

        let len = 9 + block.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(7);
        msg.extend_from_slice(&piece.to_be_bytes());
        msg.extend_from_slice(&offset.to_be_bytes());
        msg.extend_from_slice(&block);
        stream.write_all(&msg).await
    }
}
