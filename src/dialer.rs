//! Outbound peer connections
//!
//! Dials addresses supplied by the controller, performs the handshake, and
//! hands back sessions or failures. A semaphore bounds the number of
//! half-open connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, NetworkErrorKind, Result};
use crate::metainfo::Sha1Hash;
use crate::peer::session::{outbound_handshake, PeerSession};

/// Result of one dial attempt.
pub enum DialOutcome {
    Connected(PeerSession),
    Failed(SocketAddr, EngineError),
}

/// Dials outbound peers from controller-supplied addresses.
pub struct PeerDialer {
    info_hash: Sha1Hash,
    our_peer_id: [u8; 20],
    connect_timeout: Duration,
    handshake_timeout: Duration,
    half_open: Arc<Semaphore>,
}

impl PeerDialer {
    pub fn new(
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        connect_timeout: Duration,
        handshake_timeout: Duration,
        max_half_open: usize,
    ) -> Self {
        Self {
            info_hash,
            our_peer_id,
            connect_timeout,
            handshake_timeout,
            half_open: Arc::new(Semaphore::new(max_half_open)),
        }
    }

    /// Consume addresses from `addr_rx` until cancelled, emitting an
    /// outcome per attempt.
    pub fn spawn(
        self,
        mut addr_rx: mpsc::Receiver<SocketAddr>,
        outcome_tx: mpsc::Sender<DialOutcome>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let addr = tokio::select! {
                    _ = cancel.cancelled() => break,
                    addr = addr_rx.recv() => match addr {
                        Some(addr) => addr,
                        None => break,
                    },
                };

                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(&self.half_open).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let info_hash = self.info_hash;
                let our_peer_id = self.our_peer_id;
                let connect_timeout = self.connect_timeout;
                let handshake_timeout = self.handshake_timeout;
                let tx = outcome_tx.clone();
                let task_cancel = cancel.clone();

                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        _ = task_cancel.cancelled() => return,
                        result = dial(addr, info_hash, our_peer_id, connect_timeout, handshake_timeout) => {
                            match result {
                                Ok(session) => DialOutcome::Connected(session),
                                Err(e) => DialOutcome::Failed(addr, e),
                            }
                        }
                    };
                    drop(permit);
                    let _ = tx.send(outcome).await;
                });
            }
            tracing::debug!("peer dialer shut down");
        });
    }
}

async fn dial(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    our_peer_id: [u8; 20],
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<PeerSession> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| EngineError::network(NetworkErrorKind::Timeout, "peer connect timeout"))?
        .map_err(|e| {
            EngineError::network(
                NetworkErrorKind::ConnectionRefused,
                format!("failed to connect to {}: {}", addr, e),
            )
        })?;

    let handshake =
        outbound_handshake(&mut stream, info_hash, our_peer_id, handshake_timeout).await?;

    tracing::debug!("connected to peer {}", addr);
    Ok(PeerSession {
        stream,
        addr,
        handshake,
    })
}
