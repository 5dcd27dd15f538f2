//! Inbound peer connections
//!
//! Listens on the configured TCP port, performs the inbound handshake, and
//! hands completed sessions to the controller. Over-capacity connections
//! are refused only after their handshake has been read, so the remote
//! side sees a clean disconnect rather than a reset mid-preamble.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;
use crate::peer::message::{Handshake, HANDSHAKE_SIZE};
use crate::peer::session::PeerSession;

/// Listener handing inbound sessions to the controller.
pub struct PeerAcceptor {
    listener: TcpListener,
    info_hash: Sha1Hash,
    our_peer_id: [u8; 20],
    handshake_timeout: Duration,
    max_peers: usize,
    /// Connected-peer count, maintained by the controller
    peer_count: Arc<AtomicUsize>,
}

impl PeerAcceptor {
    /// Bind the listen socket. Port zero lets the OS pick; the bound port
    /// is surfaced through `local_port` and the stats snapshot.
    pub async fn bind(
        port: u16,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        handshake_timeout: Duration,
        max_peers: usize,
        peer_count: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            EngineError::network(
                NetworkErrorKind::Other,
                format!("failed to bind peer listener on port {}: {}", port, e),
            )
        })?;

        Ok(Self {
            listener,
            info_hash,
            our_peer_id,
            handshake_timeout,
            max_peers,
            peer_count,
        })
    }

    /// The actually bound port.
    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Run the accept loop until cancelled.
    pub fn spawn(self, new_peer_tx: mpsc::Sender<PeerSession>, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let (stream, addr) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    },
                };

                tracing::debug!("inbound connection from {}", addr);

                let info_hash = self.info_hash;
                let our_peer_id = self.our_peer_id;
                let deadline = self.handshake_timeout;
                let at_capacity = self.peer_count.load(Ordering::Relaxed) >= self.max_peers;
                let tx = new_peer_tx.clone();

                tokio::spawn(async move {
                    match inbound_handshake(stream, addr, info_hash, our_peer_id, deadline, at_capacity)
                        .await
                    {
                        Ok(Some(session)) => {
                            let _ = tx.send(session).await;
                        }
                        Ok(None) => {
                            tracing::debug!("refused {} at peer capacity", addr);
                        }
                        Err(e) => {
                            tracing::debug!("inbound handshake with {} failed: {}", addr, e);
                        }
                    }
                });
            }
            tracing::debug!("peer acceptor shut down");
        });
    }
}

/// Read-validate-reply handshake sequence for an inbound connection.
///
/// Returns `Ok(None)` when the connection is refused for capacity: the
/// remote handshake has been consumed, so dropping the stream reads as a
/// deliberate disconnect on the other end.
async fn inbound_handshake(
    mut stream: TcpStream,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    our_peer_id: [u8; 20],
    deadline: Duration,
    at_capacity: bool,
) -> Result<Option<PeerSession>> {
    let exchange = async {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        stream.read_exact(&mut buf).await?;
        let handshake = Handshake::decode(&buf)?;

        if handshake.info_hash != info_hash {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "infohash mismatch in inbound handshake",
            ));
        }

        if at_capacity {
            let _ = stream.shutdown().await;
            return Ok(None);
        }

        stream
            .write_all(&Handshake::new(info_hash, our_peer_id).encode())
            .await?;

        Ok(Some(PeerSession {
            stream,
            addr,
            handshake,
        }))
    };

    timeout(deadline, exchange)
        .await
        .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "inbound handshake timeout"))?
}
