//! Peer session tasks
//!
//! A connected peer runs as two sibling tasks: a reader that decodes
//! messages and forwards typed events to the controller, and a writer that
//! drains an outbound queue to the socket and keeps the connection alive.
//! All protocol state other than the raw byte counters lives in the
//! controller; sessions hold no back-pointer, only the event sender.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::message::{self, Handshake, PeerMessage, HANDSHAKE_SIZE};
use crate::bitfield::Bitfield;
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Outbound queue depth per peer. Piece payloads dominate memory here;
/// the controller stops queueing uploads when the channel is full.
const OUTBOUND_QUEUE: usize = 64;

/// Raw transfer counters, the one piece of session state shared between
/// the I/O tasks and the controller.
#[derive(Debug, Default)]
pub struct TransferCounters {
    /// Payload bytes received from the peer
    pub downloaded: AtomicU64,
    /// Payload bytes sent to the peer
    pub uploaded: AtomicU64,
}

/// Event forwarded from a session's reader task to the controller.
#[derive(Debug)]
pub struct PeerEvent {
    /// The session the event came from
    pub addr: SocketAddr,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub enum PeerEventKind {
    /// First message after the handshake was a BITFIELD
    Bitfield(Bitfield),
    /// Peer announced a piece
    Have(u32),
    /// Peer choked us
    Choked,
    /// Peer unchoked us
    Unchoked,
    /// Peer wants our data
    Interested,
    /// Peer no longer wants our data
    NotInterested,
    /// A block arrived
    Block {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Peer requested a block
    Request { index: u32, begin: u32, length: u32 },
    /// Peer withdrew a request
    Cancel { index: u32, begin: u32, length: u32 },
    /// Session terminated; the error explains why when there was one
    Dead(Option<EngineError>),
}

/// Controller-held handle to a running session.
pub struct SessionHandle {
    /// Remote address
    pub addr: SocketAddr,
    /// Remote peer id from the handshake
    pub peer_id: [u8; 20],
    /// Reserved bytes from the handshake
    pub reserved: [u8; 8],
    /// Outbound message queue
    pub outbound: mpsc::Sender<PeerMessage>,
    /// Cancels both session tasks
    pub cancel: CancellationToken,
    /// Shared transfer counters
    pub counters: Arc<TransferCounters>,
}

impl SessionHandle {
    /// Queue a message without waiting; drops the message if the queue is
    /// full (the session is stalled and will be reaped by the idle timer).
    pub fn send(&self, msg: PeerMessage) {
        if let Err(e) = self.outbound.try_send(msg) {
            tracing::debug!("outbound queue for {} rejected message: {}", self.addr, e);
        }
    }
}

/// A completed handshake ready to be spawned as a session.
pub struct PeerSession {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub handshake: Handshake,
}

impl PeerSession {
    /// Split the connection into reader and writer tasks.
    pub fn spawn(
        self,
        num_pieces: usize,
        keepalive_interval: Duration,
        idle_timeout: Duration,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();
        let counters = Arc::new(TransferCounters::default());

        let (read_half, write_half) = self.stream.into_split();

        let reader = ReaderTask {
            read_half,
            addr: self.addr,
            num_pieces,
            idle_timeout,
            event_tx,
            cancel: cancel.clone(),
            counters: Arc::clone(&counters),
            first_message_seen: false,
        };
        tokio::spawn(reader.run());

        let writer = WriterTask {
            write_half,
            addr: self.addr,
            outbound_rx,
            keepalive_interval,
            cancel: cancel.clone(),
            counters: Arc::clone(&counters),
        };
        tokio::spawn(writer.run());

        SessionHandle {
            addr: self.addr,
            peer_id: self.handshake.peer_id,
            reserved: self.handshake.reserved,
            outbound: outbound_tx,
            cancel,
            counters,
        }
    }
}

struct ReaderTask {
    read_half: OwnedReadHalf,
    addr: SocketAddr,
    num_pieces: usize,
    idle_timeout: Duration,
    event_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
    counters: Arc<TransferCounters>,
    first_message_seen: bool,
}

impl ReaderTask {
    async fn run(mut self) {
        let error = loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break None,
                read = timeout(self.idle_timeout, message::read_message(&mut self.read_half)) => {
                    match read {
                        Err(_) => break Some(EngineError::network(
                            NetworkErrorKind::Timeout,
                            "no data from peer within the idle window",
                        )),
                        Ok(Err(e)) => break Some(e),
                        Ok(Ok(msg)) => msg,
                    }
                }
            };

            if let Err(e) = self.handle(msg).await {
                break Some(e);
            }
        };

        if let Some(ref e) = error {
            tracing::debug!("peer {} reader terminating: {}", self.addr, e);
        }
        // Take the writer down with us and tell the controller.
        self.cancel.cancel();
        let _ = self
            .event_tx
            .send(PeerEvent {
                addr: self.addr,
                kind: PeerEventKind::Dead(error),
            })
            .await;
    }

    async fn handle(&mut self, msg: PeerMessage) -> Result<()> {
        // The BITFIELD rule needs one bit of history: it is only legal as
        // the very first message after the handshake.
        let first = !self.first_message_seen;
        self.first_message_seen = true;

        let kind = match msg {
            PeerMessage::KeepAlive => return Ok(()),
            PeerMessage::Choke => PeerEventKind::Choked,
            PeerMessage::Unchoke => PeerEventKind::Unchoked,
            PeerMessage::Interested => PeerEventKind::Interested,
            PeerMessage::NotInterested => PeerEventKind::NotInterested,

            PeerMessage::Have { piece_index } => {
                if piece_index as usize >= self.num_pieces {
                    return Err(EngineError::protocol(
                        ProtocolErrorKind::PeerProtocol,
                        format!("have for out-of-range piece {}", piece_index),
                    ));
                }
                PeerEventKind::Have(piece_index)
            }

            PeerMessage::Bitfield { bitfield } => {
                if !first {
                    return Err(EngineError::protocol(
                        ProtocolErrorKind::PeerProtocol,
                        "bitfield after first message",
                    ));
                }
                PeerEventKind::Bitfield(Bitfield::from_snapshot(&bitfield, self.num_pieces)?)
            }

            PeerMessage::Request {
                index,
                begin,
                length,
            } => PeerEventKind::Request {
                index,
                begin,
                length,
            },

            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                self.counters
                    .downloaded
                    .fetch_add(block.len() as u64, Ordering::Relaxed);
                PeerEventKind::Block {
                    index,
                    begin,
                    block,
                }
            }

            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => PeerEventKind::Cancel {
                index,
                begin,
                length,
            },

            PeerMessage::Port { port } => {
                tracing::trace!("peer {} sent DHT port {}, ignoring", self.addr, port);
                return Ok(());
            }

            PeerMessage::Unknown { id, payload } => {
                tracing::debug!(
                    "peer {} sent unknown message id {} ({} bytes), dropping",
                    self.addr,
                    id,
                    payload.len()
                );
                return Ok(());
            }
        };

        self.event_tx
            .send(PeerEvent {
                addr: self.addr,
                kind,
            })
            .await
            .map_err(|_| EngineError::Closed)
    }
}

struct WriterTask {
    write_half: OwnedWriteHalf,
    addr: SocketAddr,
    outbound_rx: mpsc::Receiver<PeerMessage>,
    keepalive_interval: Duration,
    cancel: CancellationToken,
    counters: Arc<TransferCounters>,
}

impl WriterTask {
    async fn run(mut self) {
        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.outbound_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = keepalive.tick() => PeerMessage::KeepAlive,
            };

            if let PeerMessage::Piece { ref block, .. } = msg {
                self.counters
                    .uploaded
                    .fetch_add(block.len() as u64, Ordering::Relaxed);
            }

            if let Err(e) = message::write_message(&mut self.write_half, &msg).await {
                tracing::debug!("peer {} writer terminating: {}", self.addr, e);
                break;
            }
            if let Err(e) = self.write_half.flush().await {
                tracing::debug!("peer {} flush failed: {}", self.addr, e);
                break;
            }

            // Any send counts as activity; push the keepalive out.
            keepalive.reset();
        }

        // Reader notices the cancellation and reports Dead.
        self.cancel.cancel();
        let _ = self.write_half.shutdown().await;
    }
}

/// Dial-side handshake: send ours, then validate the reply.
pub async fn outbound_handshake(
    stream: &mut TcpStream,
    info_hash: Sha1Hash,
    our_peer_id: [u8; 20],
    deadline: Duration,
) -> Result<Handshake> {
    let exchange = async {
        stream
            .write_all(&Handshake::new(info_hash, our_peer_id).encode())
            .await?;
        let mut buf = [0u8; HANDSHAKE_SIZE];
        stream.read_exact(&mut buf).await?;
        Ok::<_, EngineError>(buf)
    };

    let buf = timeout(deadline, exchange)
        .await
        .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "handshake timeout"))??;

    let handshake = Handshake::decode(&buf)?;
    if handshake.info_hash != info_hash {
        return Err(EngineError::protocol(
            ProtocolErrorKind::PeerProtocol,
            "infohash mismatch in handshake",
        ));
    }
    Ok(handshake)
}

