//! The per-torrent controller
//!
//! One task owns every piece of mutable engine state: the bitfield, the
//! allocator, per-peer protocol state, the choker, and the lifecycle. All
//! other tasks (sessions, acceptor, dialer, announces, hashing, storage
//! writes) communicate with it exclusively through messages, drained with
//! a fair `select!`. That single-writer discipline is what makes the
//! ordering guarantees (bitfield update before HAVE broadcast, in-order
//! per-peer events) fall out for free.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Instant, Sleep};
use tokio_util::sync::CancellationToken;

use crate::acceptor::PeerAcceptor;
use crate::allocator::RequestAllocator;
use crate::bitfield::Bitfield;
use crate::choker::{ChokeDecision, Choker, PeerChokeInfo};
use crate::config::Config;
use crate::dialer::{DialOutcome, PeerDialer};
use crate::error::{EngineError, FatalError, ProtocolErrorKind, Result};
use crate::metainfo::{Info, Sha1Hash};
use crate::peer::message::PeerMessage;
use crate::peer::session::{PeerEvent, PeerEventKind, PeerSession, SessionHandle};
use crate::peer::peer_id_client;
use crate::piece::PieceStore;
use crate::resume::{Resume, ResumeRecord};
use crate::stats::{Stats, TorrentState};
use crate::storage::Storage;
use crate::tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerSet};

/// Rate window width for the stats snapshot and the request cap.
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Awaits the re-announce timer when armed, otherwise parks the branch.
async fn armed_sleep(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot.as_mut() {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}

/// Peers requested from the tracker per announce.
const NUMWANT: u32 = 50;

/// Commands from the embedder, sent through the `Torrent` handle.
pub enum Command {
    Start,
    Stop,
    Close,
    SetResume(Arc<dyn Resume>, oneshot::Sender<Result<()>>),
    SetInfo(Box<Info>, oneshot::Sender<Result<()>>),
}

/// Results reported back by worker tasks the controller spawned.
enum TaskEvent {
    /// Resume load + re-verification finished (start-up path)
    ResumeChecked {
        valid_pieces: Vec<u32>,
        downloaded: u64,
        uploaded: u64,
    },
    /// A block write (with its one retry) finished
    BlockWritten { piece: u32, result: Result<()> },
    /// Piece hashing finished
    PieceVerified { piece: u32, ok: bool },
    /// A block read for an upload finished
    UploadRead {
        addr: SocketAddr,
        index: u32,
        begin: u32,
        result: Result<Vec<u8>>,
    },
    /// An announce round finished
    Announced {
        event: AnnounceEvent,
        result: Result<AnnounceResponse>,
    },
}

/// Everything the controller tracks about one connected peer.
struct PeerState {
    handle: SessionHandle,
    remote_bitfield: Bitfield,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    bad_pieces: u32,
    pending_uploads: HashSet<(u32, u32, u32)>,
    /// (sample time, cumulative down, cumulative up), newest last
    rate_samples: VecDeque<(Instant, u64, u64)>,
}

impl PeerState {
    fn new(handle: SessionHandle, num_pieces: usize) -> Self {
        Self {
            handle,
            remote_bitfield: Bitfield::new(num_pieces),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bad_pieces: 0,
            pending_uploads: HashSet::new(),
            rate_samples: VecDeque::new(),
        }
    }

    fn sample_rates(&mut self, now: Instant) {
        let down = self.handle.counters.downloaded.load(Ordering::Relaxed);
        let up = self.handle.counters.uploaded.load(Ordering::Relaxed);
        self.rate_samples.push_back((now, down, up));
        while let Some(&(t, _, _)) = self.rate_samples.front() {
            if now.duration_since(t) > RATE_WINDOW && self.rate_samples.len() > 2 {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn rates(&self) -> (u64, u64) {
        let (Some(&(t0, d0, u0)), Some(&(t1, d1, u1))) =
            (self.rate_samples.front(), self.rate_samples.back())
        else {
            return (0, 0);
        };
        let span = t1.duration_since(t0).as_secs_f64();
        if span <= f64::EPSILON {
            return (0, 0);
        }
        (
            ((d1 - d0) as f64 / span) as u64,
            ((u1 - u0) as f64 / span) as u64,
        )
    }
}

/// Construction-time wiring for the controller task.
pub struct ControllerSeed {
    pub config: Config,
    pub info: Option<Arc<Info>>,
    pub info_hash: Sha1Hash,
    pub name: String,
    pub tiers: Vec<Vec<String>>,
    pub listen_port: u16,
    pub storage: Arc<dyn Storage>,
    pub cmd_rx: mpsc::Receiver<Command>,
    pub stats_tx: watch::Sender<Stats>,
    pub complete_tx: watch::Sender<bool>,
    pub error_tx: watch::Sender<Option<FatalError>>,
}

pub struct Controller {
    config: Config,
    info: Option<Arc<Info>>,
    info_hash: Sha1Hash,
    name: String,
    peer_id: [u8; 20],
    listen_port: u16,
    actual_port: u16,

    storage: Arc<dyn Storage>,
    piece_store: Option<PieceStore>,
    resume: Option<Arc<dyn Resume>>,
    tracker: Option<Arc<TrackerSet>>,
    tiers: Vec<Vec<String>>,

    state: TorrentState,
    bitfield: Bitfield,
    allocator: Option<RequestAllocator>,
    choker: Choker,

    peers: HashMap<SocketAddr, PeerState>,
    peer_count: Arc<AtomicUsize>,
    banned: HashSet<IpAddr>,
    known_addrs: HashSet<SocketAddr>,
    connecting: HashSet<SocketAddr>,
    /// Peer ids the tracker advertised per address (dict responses only)
    advertised_ids: HashMap<SocketAddr, [u8; 20]>,

    /// Blocks written but not yet hash-checked, per piece
    writes_in_flight: HashMap<u32, u32>,
    /// Pieces whose blocks have all arrived, awaiting the last write
    pending_verify: HashSet<u32>,
    /// Which peers contributed blocks to each in-flight piece
    contributors: HashMap<u32, HashSet<SocketAddr>>,

    downloaded: u64,
    uploaded: u64,
    verified_bytes: u64,

    /// Consecutive announce rounds yielding no usable peers
    barren_announces: u32,
    last_peer_seen: Instant,
    announce_in_flight: bool,
    next_announce: Option<Pin<Box<Sleep>>>,
    completed_announce_sent: bool,
    resume_set: bool,

    // Channels
    cmd_rx: mpsc::Receiver<Command>,
    peer_event_tx: mpsc::Sender<PeerEvent>,
    peer_event_rx: mpsc::Receiver<PeerEvent>,
    accept_rx: mpsc::Receiver<PeerSession>,
    accept_tx: mpsc::Sender<PeerSession>,
    dial_addr_tx: Option<mpsc::Sender<SocketAddr>>,
    dial_outcome_rx: mpsc::Receiver<DialOutcome>,
    dial_outcome_tx: mpsc::Sender<DialOutcome>,
    task_tx: mpsc::Sender<TaskEvent>,
    task_rx: mpsc::Receiver<TaskEvent>,

    stats_tx: watch::Sender<Stats>,
    complete_tx: watch::Sender<bool>,
    error_tx: watch::Sender<Option<FatalError>>,

    /// Cancels the acceptor, dialer, and any outstanding worker tasks
    engine_cancel: CancellationToken,
}

impl Controller {
    pub fn new(seed: ControllerSeed) -> Self {
        let num_pieces = seed.info.as_ref().map(|i| i.num_pieces()).unwrap_or(0);
        let piece_store = seed
            .info
            .as_ref()
            .map(|info| PieceStore::new(Arc::clone(info), Arc::clone(&seed.storage)));
        let allocator = seed.info.as_ref().map(|info| RequestAllocator::new(Arc::clone(info)));

        let (peer_event_tx, peer_event_rx) = mpsc::channel(256);
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let (dial_outcome_tx, dial_outcome_rx) = mpsc::channel(64);
        let (task_tx, task_rx) = mpsc::channel(256);

        // The optimistic slot rotates once per this many choke rounds.
        let optimistic_rounds = (seed.config.optimistic_interval.as_millis()
            / seed.config.choke_interval.as_millis().max(1))
        .max(1) as u32;

        Self {
            config: seed.config,
            info: seed.info,
            info_hash: seed.info_hash,
            name: seed.name,
            peer_id: crate::tracker::generate_peer_id(),
            listen_port: seed.listen_port,
            actual_port: 0,
            storage: seed.storage,
            piece_store,
            resume: None,
            tracker: None,
            tiers: seed.tiers,
            state: TorrentState::Stopped,
            bitfield: Bitfield::new(num_pieces),
            allocator,
            choker: Choker::new(4, optimistic_rounds),
            peers: HashMap::new(),
            peer_count: Arc::new(AtomicUsize::new(0)),
            banned: HashSet::new(),
            known_addrs: HashSet::new(),
            connecting: HashSet::new(),
            advertised_ids: HashMap::new(),
            writes_in_flight: HashMap::new(),
            pending_verify: HashSet::new(),
            contributors: HashMap::new(),
            downloaded: 0,
            uploaded: 0,
            verified_bytes: 0,
            barren_announces: 0,
            last_peer_seen: Instant::now(),
            announce_in_flight: false,
            next_announce: None,
            completed_announce_sent: false,
            resume_set: false,
            cmd_rx: seed.cmd_rx,
            peer_event_tx,
            peer_event_rx,
            accept_rx,
            accept_tx,
            dial_addr_tx: None,
            dial_outcome_rx,
            dial_outcome_tx,
            task_tx,
            task_rx,
            stats_tx: seed.stats_tx,
            complete_tx: seed.complete_tx,
            error_tx: seed.error_tx,
            engine_cancel: CancellationToken::new(),
        }
    }

    /// The event loop. Runs until Close.
    pub async fn run(mut self) {
        let mut allocator_tick = tokio::time::interval(self.config.allocator_tick);
        let mut choke_tick = tokio::time::interval(self.config.choke_interval);
        let mut resume_tick = tokio::time::interval(self.config.resume_interval);
        allocator_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        choke_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        resume_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Start) => self.on_start().await,
                        Some(Command::Stop) => self.on_stop().await,
                        Some(Command::Close) | None => {
                            self.on_close().await;
                            break;
                        }
                        Some(Command::SetResume(resume, ack)) => {
                            let _ = ack.send(self.on_set_resume(resume));
                        }
                        Some(Command::SetInfo(info, ack)) => {
                            let _ = ack.send(self.on_set_info(*info));
                        }
                    }
                }

                Some(event) = self.peer_event_rx.recv() => {
                    self.on_peer_event(event).await;
                }

                Some(session) = self.accept_rx.recv() => {
                    self.on_new_peer(session, true);
                }

                Some(outcome) = self.dial_outcome_rx.recv() => {
                    match outcome {
                        DialOutcome::Connected(session) => {
                            self.connecting.remove(&session.addr);
                            self.on_new_peer(session, false);
                        }
                        DialOutcome::Failed(addr, e) => {
                            tracing::debug!("dial {} failed: {}", addr, e);
                            self.connecting.remove(&addr);
                        }
                    }
                }

                Some(event) = self.task_rx.recv() => {
                    self.on_task_event(event).await;
                }

                _ = allocator_tick.tick() => {
                    self.on_allocator_tick();
                }

                _ = choke_tick.tick() => {
                    self.on_choke_round();
                }

                _ = resume_tick.tick() => {
                    self.write_resume(false).await;
                }

                _ = armed_sleep(&mut self.next_announce) => {
                    self.next_announce = None;
                    self.spawn_announce(AnnounceEvent::None);
                }
            }

            self.check_fatal_conditions();
            self.publish_stats();
        }
    }

    fn is_running(&self) -> bool {
        matches!(
            self.state,
            TorrentState::Metadata
                | TorrentState::Verifying
                | TorrentState::Downloading
                | TorrentState::Seeding
        )
    }

    // Lifecycle

    async fn on_start(&mut self) {
        if self.is_running() {
            tracing::debug!("start: already running ({})", self.state);
            return;
        }
        if self.state == TorrentState::Closed {
            return;
        }

        tracing::info!("starting torrent {}", self.name);
        self.barren_announces = 0;
        self.last_peer_seen = Instant::now();

        if self.tracker.is_none() {
            match TrackerSet::new(self.tiers.clone(), self.config.announce_timeout) {
                Ok(set) => self.tracker = Some(Arc::new(set)),
                Err(e) => tracing::warn!("tracker client unavailable: {}", e),
            }
        }

        if self.actual_port == 0 {
            match PeerAcceptor::bind(
                self.listen_port,
                self.info_hash,
                self.peer_id,
                self.config.handshake_timeout,
                self.config.max_peers,
                Arc::clone(&self.peer_count),
            )
            .await
            {
                Ok(acceptor) => {
                    self.actual_port = acceptor.local_port();
                    acceptor.spawn(self.accept_tx.clone(), self.engine_cancel.clone());
                    tracing::info!("accepting peers on port {}", self.actual_port);
                }
                Err(e) => {
                    self.fatal(e);
                    return;
                }
            }
        }

        if self.dial_addr_tx.is_none() {
            let (dial_addr_tx, dial_addr_rx) = mpsc::channel(256);
            let dialer = PeerDialer::new(
                self.info_hash,
                self.peer_id,
                self.config.connect_timeout,
                self.config.handshake_timeout,
                self.config.max_half_open,
            );
            dialer.spawn(
                dial_addr_rx,
                self.dial_outcome_tx.clone(),
                self.engine_cancel.clone(),
            );
            self.dial_addr_tx = Some(dial_addr_tx);
        }

        if self.info.is_none() {
            // Magnet construction without the info dictionary: announce
            // and hold the swarm open until set_info arrives.
            self.state = TorrentState::Metadata;
            self.spawn_announce(AnnounceEvent::Started);
            return;
        }

        if let (Some(resume), Some(store)) = (self.resume.clone(), self.piece_store.clone()) {
            if self.bitfield.count() == 0 {
                self.state = TorrentState::Verifying;
                self.spawn_resume_check(resume, store);
                return;
            }
        }

        self.enter_transfer_state();
        self.spawn_announce(AnnounceEvent::Started);
    }

    fn enter_transfer_state(&mut self) {
        if self.bitfield.len() > 0 && self.bitfield.is_full() {
            self.state = TorrentState::Seeding;
        } else {
            self.state = TorrentState::Downloading;
        }
    }

    /// Load the resume record and re-verify every piece it claims, off
    /// the controller task. Claimed bits only count after their bytes
    /// hash correctly from storage.
    fn spawn_resume_check(&self, resume: Arc<dyn Resume>, store: PieceStore) {
        let task_tx = self.task_tx.clone();
        let info_hash = self.info_hash;
        let num_pieces = store.info().num_pieces();
        let cancel = self.engine_cancel.clone();

        tokio::spawn(async move {
            let checked = async {
                let record = match resume.load().await {
                    Ok(Some(record)) if record.info_hash == info_hash => record,
                    Ok(Some(_)) => {
                        tracing::warn!("resume record is for a different torrent, ignoring");
                        return TaskEvent::ResumeChecked {
                            valid_pieces: Vec::new(),
                            downloaded: 0,
                            uploaded: 0,
                        };
                    }
                    Ok(None) => {
                        return TaskEvent::ResumeChecked {
                            valid_pieces: Vec::new(),
                            downloaded: 0,
                            uploaded: 0,
                        }
                    }
                    Err(e) => {
                        tracing::warn!("resume load failed: {}", e);
                        return TaskEvent::ResumeChecked {
                            valid_pieces: Vec::new(),
                            downloaded: 0,
                            uploaded: 0,
                        };
                    }
                };

                let claimed = match Bitfield::from_snapshot(&record.bitfield, num_pieces) {
                    Ok(bf) => bf,
                    Err(e) => {
                        tracing::warn!("resume bitfield malformed: {}", e);
                        return TaskEvent::ResumeChecked {
                            valid_pieces: Vec::new(),
                            downloaded: 0,
                            uploaded: 0,
                        };
                    }
                };

                let mut valid_pieces = Vec::new();
                for piece in claimed.iter_set() {
                    match store.verify(piece as u32).await {
                        Ok(true) => valid_pieces.push(piece as u32),
                        Ok(false) => {
                            tracing::warn!("resume-claimed piece {} failed re-verification", piece)
                        }
                        Err(e) => tracing::warn!("re-verification of piece {} failed: {}", piece, e),
                    }
                }

                TaskEvent::ResumeChecked {
                    valid_pieces,
                    downloaded: record.downloaded,
                    uploaded: record.uploaded,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                event = checked => {
                    let _ = task_tx.send(event).await;
                }
            }
        });
    }

    async fn on_stop(&mut self) {
        if !self.is_running() {
            tracing::debug!("stop: not running ({})", self.state);
            return;
        }

        tracing::info!("stopping torrent {}", self.name);
        self.state = TorrentState::Stopping;

        self.disconnect_all_peers();
        self.next_announce = None;
        self.spawn_stopped_announce();
        self.write_resume(true).await;

        self.state = TorrentState::Stopped;
        self.publish_stats();
    }

    async fn on_close(&mut self) {
        tracing::info!("closing torrent {}", self.name);
        if self.is_running() {
            self.state = TorrentState::Stopping;
            self.disconnect_all_peers();
            self.next_announce = None;
            self.spawn_stopped_announce();
            self.write_resume(true).await;
        }

        self.engine_cancel.cancel();

        if let Some(resume) = self.resume.take() {
            if let Err(e) = resume.close().await {
                tracing::warn!("resume close failed: {}", e);
            }
        }

        let flush = async {
            self.storage.flush().await?;
            self.storage.close().await
        };
        match tokio::time::timeout(self.config.shutdown_timeout, flush).await {
            Ok(Err(e)) => tracing::warn!("storage close failed: {}", e),
            Err(_) => tracing::warn!("storage close timed out"),
            Ok(Ok(())) => {}
        }

        self.state = TorrentState::Closed;
        self.publish_stats();
    }

    fn on_set_resume(&mut self, resume: Arc<dyn Resume>) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::InvalidState {
                action: "set resume",
                current_state: self.state.to_string(),
            });
        }
        if self.resume_set {
            return Err(EngineError::invalid_input(
                "resume",
                "resume backend already set",
            ));
        }
        self.resume = Some(resume);
        self.resume_set = true;
        Ok(())
    }

    fn on_set_info(&mut self, info: Info) -> Result<()> {
        if self.info.is_some() {
            return Err(EngineError::invalid_input(
                "info",
                "info dictionary already present",
            ));
        }
        if info.info_hash != self.info_hash {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                "info dictionary does not match the magnet infohash",
            ));
        }

        let info = Arc::new(info);
        self.bitfield = Bitfield::new(info.num_pieces());
        self.piece_store = Some(PieceStore::new(Arc::clone(&info), Arc::clone(&self.storage)));
        self.allocator = Some(RequestAllocator::new(Arc::clone(&info)));
        self.info = Some(info);

        // Sessions were speaking a zero-piece dialect; restart them.
        self.disconnect_all_peers();
        if self.state == TorrentState::Metadata {
            self.enter_transfer_state();
            self.dial_candidates();
        }
        Ok(())
    }

    // Peer lifecycle

    fn on_new_peer(&mut self, session: PeerSession, inbound: bool) {
        if !self.is_running() || self.state == TorrentState::Verifying {
            tracing::debug!("dropping {} session: state {}", session.addr, self.state);
            return;
        }
        if self.banned.contains(&session.addr.ip()) {
            tracing::debug!("dropping banned peer {}", session.addr);
            return;
        }
        if self.peers.len() >= self.config.max_peers || self.peers.contains_key(&session.addr) {
            tracing::debug!("dropping surplus session {}", session.addr);
            return;
        }

        if let Some(advertised) = self.advertised_ids.get(&session.addr) {
            if *advertised != session.handshake.peer_id {
                tracing::warn!(
                    "peer {} handshake id differs from tracker-advertised id",
                    session.addr
                );
            }
        }

        let addr = session.addr;
        let num_pieces = self.info.as_ref().map(|i| i.num_pieces()).unwrap_or(0);
        let handle = session.spawn(
            num_pieces,
            self.config.keepalive_interval,
            self.config.idle_timeout,
            self.peer_event_tx.clone(),
        );

        if let Some(client) = peer_id_client(&handle.peer_id) {
            tracing::debug!(
                "{} session with {} ({})",
                if inbound { "inbound" } else { "outbound" },
                addr,
                client
            );
        }

        // A non-empty bitfield goes out as our first message.
        if self.bitfield.count() > 0 {
            handle.send(PeerMessage::Bitfield {
                bitfield: self.bitfield.snapshot(),
            });
        }

        let mut peer = PeerState::new(handle, num_pieces);
        peer.sample_rates(Instant::now());
        self.peers.insert(addr, peer);
        self.peer_count.store(self.peers.len(), Ordering::Relaxed);
        self.known_addrs.insert(addr);
        self.last_peer_seen = Instant::now();
    }

    fn drop_peer(&mut self, addr: SocketAddr, ban: bool, reason: &str) {
        let Some(peer) = self.peers.remove(&addr) else {
            return;
        };
        tracing::debug!("dropping peer {}: {}", addr, reason);
        peer.handle.cancel.cancel();

        if let Some(alloc) = self.allocator.as_mut() {
            alloc.peer_disconnected(addr, &peer.remote_bitfield);
        }
        self.choker.peer_disconnected(addr);
        self.peer_count.store(self.peers.len(), Ordering::Relaxed);

        if ban {
            tracing::warn!("banning peer {} for this session: {}", addr, reason);
            self.banned.insert(addr.ip());
            self.known_addrs.remove(&addr);
        }
    }

    fn disconnect_all_peers(&mut self) {
        for (addr, peer) in self.peers.drain() {
            tracing::debug!("closing session {}", addr);
            peer.handle.cancel.cancel();
            if let Some(alloc) = self.allocator.as_mut() {
                alloc.peer_disconnected(addr, &peer.remote_bitfield);
            }
            self.choker.peer_disconnected(addr);
        }
        self.connecting.clear();
        self.peer_count.store(0, Ordering::Relaxed);
    }

    // Peer events

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let addr = event.addr;
        if !self.peers.contains_key(&addr) {
            return;
        }

        match event.kind {
            PeerEventKind::Dead(error) => {
                let reason = error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "session closed".to_string());
                self.drop_peer(addr, false, &reason);
            }

            PeerEventKind::Bitfield(bf) => {
                if let Some(alloc) = self.allocator.as_mut() {
                    alloc.peer_connected(&bf);
                }
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.remote_bitfield = bf;
                }
                self.update_interest(addr);
            }

            PeerEventKind::Have(piece) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    if !peer.remote_bitfield.test(piece as usize) {
                        peer.remote_bitfield.set(piece as usize);
                        if let Some(alloc) = self.allocator.as_mut() {
                            alloc.peer_has(piece);
                        }
                    }
                }
                self.update_interest(addr);
            }

            PeerEventKind::Choked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = true;
                }
                if let Some(alloc) = self.allocator.as_mut() {
                    alloc.peer_choked(addr);
                }
            }

            PeerEventKind::Unchoked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = false;
                }
                self.fill_requests(addr);
            }

            PeerEventKind::Interested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = true;
                }
            }

            PeerEventKind::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = false;
                }
            }

            PeerEventKind::Request {
                index,
                begin,
                length,
            } => {
                self.on_upload_request(addr, index, begin, length);
            }

            PeerEventKind::Cancel {
                index,
                begin,
                length,
            } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.pending_uploads.remove(&(index, begin, length));
                }
            }

            PeerEventKind::Block {
                index,
                begin,
                block,
            } => {
                self.on_block(addr, index, begin, block);
            }
        }
    }

    /// Send INTERESTED/NOT_INTERESTED on transitions of whether the peer
    /// has pieces we still need.
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(alloc) = self.allocator.as_ref() else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };

        let wanted = alloc.peer_has_needed(&peer.remote_bitfield);
        if wanted && !peer.am_interested {
            peer.am_interested = true;
            peer.handle.send(PeerMessage::Interested);
        } else if !wanted && peer.am_interested {
            peer.am_interested = false;
            peer.handle.send(PeerMessage::NotInterested);
        }
    }

    fn on_upload_request(&mut self, addr: SocketAddr, index: u32, begin: u32, length: u32) {
        let Some(store) = self.piece_store.clone() else {
            return;
        };

        if let Err(e) = store.validate_request(index, begin, length) {
            self.drop_peer(addr, false, &e.to_string());
            return;
        }

        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };

        // Requests from choked peers are silently dropped.
        if peer.am_choking {
            tracing::trace!("ignoring request from choked peer {}", addr);
            return;
        }
        if !self.bitfield.test(index as usize) {
            tracing::debug!("peer {} requested piece {} we lack", addr, index);
            return;
        }

        peer.pending_uploads.insert((index, begin, length));

        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let result = store.read_block(index, begin, length).await;
            let _ = task_tx
                .send(TaskEvent::UploadRead {
                    addr,
                    index,
                    begin,
                    result,
                })
                .await;
        });
    }

    fn on_block(&mut self, addr: SocketAddr, index: u32, begin: u32, block: Vec<u8>) {
        let Some(store) = self.piece_store.clone() else {
            return;
        };
        if let Err(e) = store.validate_request(index, begin, block.len() as u32) {
            self.drop_peer(addr, false, &e.to_string());
            return;
        }

        let Some(alloc) = self.allocator.as_mut() else {
            return;
        };
        let receipt = alloc.block_received(addr, index, begin);

        // End-game duplicate: the first copy won, this one is discarded.
        if receipt.duplicate {
            tracing::trace!("discarding duplicate block {}:{} from {}", index, begin, addr);
            return;
        }

        for other in &receipt.cancel_peers {
            if let Some(peer) = self.peers.get(other) {
                peer.handle.send(PeerMessage::Cancel {
                    index,
                    begin,
                    length: block.len() as u32,
                });
            }
        }

        self.downloaded += block.len() as u64;
        self.contributors.entry(index).or_default().insert(addr);
        *self.writes_in_flight.entry(index).or_insert(0) += 1;
        if receipt.piece_complete {
            self.pending_verify.insert(index);
        }

        // Write off-loop; the first failure is retried once after a
        // second, the second is fatal for the torrent. Cancellation on
        // close keeps storage untouched once close() has returned.
        let task_tx = self.task_tx.clone();
        let cancel = self.engine_cancel.clone();
        tokio::spawn(async move {
            let write = async {
                let mut result = store.write_block(index, begin, &block).await;
                if let Err(ref e) = result {
                    tracing::warn!("storage write for piece {} failed, retrying: {}", index, e);
                    sleep(Duration::from_secs(1)).await;
                    result = store.write_block(index, begin, &block).await;
                }
                result
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = write => {
                    let _ = task_tx
                        .send(TaskEvent::BlockWritten {
                            piece: index,
                            result,
                        })
                        .await;
                }
            }
        });

        // Keep the pipeline full.
        self.fill_requests(addr);
    }

    // Worker task results

    async fn on_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::ResumeChecked {
                valid_pieces,
                downloaded,
                uploaded,
            } => {
                if self.state != TorrentState::Verifying {
                    return;
                }
                for piece in &valid_pieces {
                    self.bitfield.set(*piece as usize);
                    if let Some(alloc) = self.allocator.as_mut() {
                        alloc.mark_present(*piece);
                    }
                    if let Some(len) = self.info.as_ref().and_then(|i| i.piece_len(*piece as usize))
                    {
                        self.verified_bytes += len;
                    }
                }
                self.downloaded = downloaded;
                self.uploaded = uploaded;
                tracing::info!(
                    "resume check accepted {} pieces for {}",
                    valid_pieces.len(),
                    self.name
                );

                self.completed_announce_sent = self.bitfield.is_full();
                self.enter_transfer_state();
                if self.bitfield.is_full() {
                    let _ = self.complete_tx.send(true);
                }
                self.spawn_announce(AnnounceEvent::Started);
            }

            TaskEvent::BlockWritten { piece, result } => {
                if let Err(e) = result {
                    self.fatal(e);
                    return;
                }
                if let Some(count) = self.writes_in_flight.get_mut(&piece) {
                    *count -= 1;
                    if *count == 0 {
                        self.writes_in_flight.remove(&piece);
                        if self.pending_verify.remove(&piece) {
                            self.spawn_verify(piece);
                        }
                    }
                }
            }

            TaskEvent::PieceVerified { piece, ok } => {
                self.on_piece_verified(piece, ok).await;
            }

            TaskEvent::UploadRead {
                addr,
                index,
                begin,
                result,
            } => {
                let Some(peer) = self.peers.get_mut(&addr) else {
                    return;
                };
                let block = match result {
                    Ok(block) => block,
                    Err(e) => {
                        tracing::debug!("upload read {}:{} failed: {}", index, begin, e);
                        return;
                    }
                };
                // The peer may have CANCELed while the read was in flight.
                if !peer
                    .pending_uploads
                    .remove(&(index, begin, block.len() as u32))
                {
                    return;
                }
                self.uploaded += block.len() as u64;
                peer.handle.send(PeerMessage::Piece {
                    index,
                    begin,
                    block,
                });
            }

            TaskEvent::Announced { event, result } => {
                self.on_announce_result(event, result);
            }
        }
    }

    fn spawn_verify(&self, piece: u32) {
        let Some(store) = self.piece_store.clone() else {
            return;
        };
        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let ok = match store.verify(piece).await {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::warn!("verification read for piece {} failed: {}", piece, e);
                    false
                }
            };
            let _ = task_tx.send(TaskEvent::PieceVerified { piece, ok }).await;
        });
    }

    async fn on_piece_verified(&mut self, piece: u32, ok: bool) {
        let contributors = self.contributors.remove(&piece).unwrap_or_default();

        if !ok {
            tracing::warn!("piece {} failed hash verification", piece);
            if let Some(alloc) = self.allocator.as_mut() {
                alloc.piece_failed(piece);
            }

            // Attribute the bad piece to everyone who fed it blocks.
            let mut to_ban = Vec::new();
            for addr in contributors {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bad_pieces += 1;
                    if peer.bad_pieces > self.config.max_bad_pieces {
                        to_ban.push(addr);
                    }
                }
            }
            for addr in to_ban {
                self.drop_peer(addr, true, "too many bad pieces");
            }
            return;
        }

        if self.bitfield.test(piece as usize) {
            return;
        }

        self.bitfield.set(piece as usize);
        if let Some(alloc) = self.allocator.as_mut() {
            alloc.piece_verified(piece);
        }
        if let Some(len) = self.info.as_ref().and_then(|i| i.piece_len(piece as usize)) {
            self.verified_bytes += len;
        }
        tracing::debug!(
            "piece {} verified ({}/{})",
            piece,
            self.bitfield.count(),
            self.bitfield.len()
        );

        // The bitfield update above is ordered before this broadcast: no
        // peer ever sees a HAVE the local bitfield does not back.
        for peer in self.peers.values() {
            peer.handle.send(PeerMessage::Have { piece_index: piece });
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr);
        }

        if self.bitfield.is_full() {
            tracing::info!("download complete for {}", self.name);
            self.state = TorrentState::Seeding;
            if !self.completed_announce_sent {
                self.completed_announce_sent = true;
                self.spawn_announce(AnnounceEvent::Completed);
            }
            // Resume write is enqueued before the completion signal fires.
            self.write_resume(false).await;
            let _ = self.complete_tx.send(true);
        }
    }

    // Requests

    fn fill_requests(&mut self, addr: SocketAddr) {
        if self.state != TorrentState::Downloading {
            return;
        }
        let connected = self.peers.len();
        let Some(alloc) = self.allocator.as_mut() else {
            return;
        };
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        if peer.peer_choking || !peer.am_interested {
            return;
        }

        let (down_rate, _) = peer.rates();
        let cap = RequestAllocator::request_cap(
            down_rate,
            self.config.min_requests_per_peer,
            self.config.max_requests_per_peer,
        );
        let outstanding = alloc.outstanding(addr);
        if outstanding >= cap {
            return;
        }

        let requests = alloc.next_requests(addr, &peer.remote_bitfield, cap - outstanding, connected);
        for request in requests {
            peer.handle.send(PeerMessage::Request {
                index: request.piece,
                begin: request.offset,
                length: request.length,
            });
        }
    }

    fn on_allocator_tick(&mut self) {
        if !self.is_running() {
            return;
        }

        let now = Instant::now();
        for peer in self.peers.values_mut() {
            peer.sample_rates(now);
        }

        if self.state == TorrentState::Downloading {
            let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
            for addr in addrs {
                self.fill_requests(addr);
            }
            self.dial_candidates();
        }
        if !self.peers.is_empty() {
            self.last_peer_seen = Instant::now();
        }
    }

    // Choking

    fn on_choke_round(&mut self) {
        if !matches!(
            self.state,
            TorrentState::Downloading | TorrentState::Seeding
        ) {
            return;
        }

        let seeding = self.state == TorrentState::Seeding;
        let infos: Vec<PeerChokeInfo> = self
            .peers
            .iter()
            .map(|(addr, peer)| {
                let (download_rate, upload_rate) = peer.rates();
                PeerChokeInfo {
                    addr: *addr,
                    download_rate,
                    upload_rate,
                    peer_interested: peer.peer_interested,
                    is_unchoked: !peer.am_choking,
                }
            })
            .collect();

        for decision in self.choker.round(&infos, seeding) {
            match decision {
                ChokeDecision::Unchoke(addr) => {
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        peer.am_choking = false;
                        peer.handle.send(PeerMessage::Unchoke);
                    }
                }
                ChokeDecision::Choke(addr) => {
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        peer.am_choking = true;
                        peer.pending_uploads.clear();
                        peer.handle.send(PeerMessage::Choke);
                    }
                }
            }
        }
    }

    // Trackers

    fn announce_request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let total = self.info.as_ref().map(|i| i.total_size).unwrap_or(0);
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.actual_port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: total.saturating_sub(self.verified_bytes),
            event,
            numwant: NUMWANT,
        }
    }

    fn spawn_announce(&mut self, event: AnnounceEvent) {
        let Some(tracker) = self.tracker.clone() else {
            return;
        };
        // Only periodic announces coalesce; event announces always go out.
        if tracker.is_empty() || (self.announce_in_flight && event == AnnounceEvent::None) {
            return;
        }

        self.announce_in_flight = true;
        let request = self.announce_request(event);
        let task_tx = self.task_tx.clone();
        let cancel = self.engine_cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = tracker.announce(&request) => {
                    let _ = task_tx.send(TaskEvent::Announced { event, result }).await;
                }
            }
        });
    }

    /// Best-effort stopped announce, detached and bounded.
    fn spawn_stopped_announce(&mut self) {
        let Some(tracker) = self.tracker.clone() else {
            return;
        };
        if tracker.is_empty() {
            return;
        }
        let request = self.announce_request(AnnounceEvent::Stopped);
        let bound = self.config.shutdown_timeout;
        tokio::spawn(async move {
            if tokio::time::timeout(bound, tracker.announce(&request))
                .await
                .is_err()
            {
                tracing::debug!("stopped announce timed out");
            }
        });
    }

    fn on_announce_result(&mut self, event: AnnounceEvent, result: Result<AnnounceResponse>) {
        self.announce_in_flight = false;

        let next = match result {
            Ok(response) => {
                if response.peers.is_empty() {
                    self.barren_announces += 1;
                } else {
                    self.barren_announces = 0;
                }

                for peer in &response.peers {
                    let Some(addr) = peer.to_socket_addr() else {
                        continue;
                    };
                    if let Some(id) = peer.peer_id {
                        self.advertised_ids.insert(addr, id);
                    }
                    if !self.banned.contains(&addr.ip()) {
                        self.known_addrs.insert(addr);
                    }
                }

                tracing::debug!(
                    "announce ({:?}) returned {} peers, next in {:?}",
                    event,
                    response.peers.len(),
                    response.next_announce_in()
                );

                self.dial_candidates();
                response.next_announce_in()
            }
            Err(e) => {
                tracing::warn!("announce failed: {}", e);
                self.barren_announces += 1;
                self.config.tracker_backoff
            }
        };

        if self.is_running() {
            self.next_announce = Some(Box::pin(sleep(next)));
        }
    }

    fn dial_candidates(&mut self) {
        if !matches!(
            self.state,
            TorrentState::Metadata | TorrentState::Downloading | TorrentState::Seeding
        ) {
            return;
        }
        let Some(dial_tx) = self.dial_addr_tx.clone() else {
            return;
        };

        let budget = self
            .config
            .max_peers
            .saturating_sub(self.peers.len() + self.connecting.len());

        let mut candidates: Vec<SocketAddr> = self
            .known_addrs
            .iter()
            .filter(|a| {
                !self.peers.contains_key(a)
                    && !self.connecting.contains(a)
                    && !self.banned.contains(&a.ip())
            })
            .copied()
            .collect();
        candidates.sort();
        candidates.truncate(budget);

        for addr in candidates {
            if dial_tx.try_send(addr).is_ok() {
                self.connecting.insert(addr);
            }
        }
    }

    // Resume

    async fn write_resume(&mut self, flush: bool) {
        let Some(resume) = self.resume.clone() else {
            return;
        };
        if !self.is_running() && !flush {
            return;
        }

        let record = ResumeRecord {
            info_hash: self.info_hash,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            bitfield: self.bitfield.snapshot(),
        };

        if flush {
            // Shutdown path: bounded, awaited in place.
            match tokio::time::timeout(self.config.shutdown_timeout, resume.save(&record)).await {
                Ok(Err(e)) => tracing::warn!("resume save failed: {}", e),
                Err(_) => tracing::warn!("resume save timed out"),
                Ok(Ok(())) => {}
            }
        } else {
            let cancel = self.engine_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = resume.save(&record) => {
                        if let Err(e) = result {
                            // Resume failures are never fatal.
                            tracing::warn!("resume save failed: {}", e);
                        }
                    }
                }
            });
        }
    }

    // Fatal errors

    fn fatal(&mut self, error: EngineError) {
        tracing::error!("fatal error for {}: {}", self.name, error);
        let fatal: FatalError = Arc::new(error);
        let _ = self.error_tx.send(Some(Arc::clone(&fatal)));

        // Auto-stop: tear sessions down but keep the controller alive so
        // the embedder can still observe state and close cleanly.
        self.disconnect_all_peers();
        self.next_announce = None;
        self.state = TorrentState::Stopped;
    }

    fn check_fatal_conditions(&mut self) {
        if !self.is_running() {
            return;
        }
        if self.barren_announces >= self.config.max_barren_announces
            && self.peers.is_empty()
            && self.last_peer_seen.elapsed() >= self.config.peerless_fatal_after
        {
            self.fatal(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "trackers unreachable and no peers available",
            ));
        }
    }

    // Stats

    fn publish_stats(&self) {
        let mut download_rate = 0u64;
        let mut upload_rate = 0u64;
        for peer in self.peers.values() {
            let (d, u) = peer.rates();
            download_rate += d;
            upload_rate += u;
        }

        let total = self.info.as_ref().map(|i| i.total_size).unwrap_or(0);
        let stats = Stats {
            state: self.state,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            left: total.saturating_sub(self.verified_bytes),
            download_rate,
            upload_rate,
            peers: self.peers.len(),
            pieces_complete: self.bitfield.count(),
            pieces_total: self.bitfield.len(),
            listen_port: self.actual_port,
        };
        let _ = self.stats_tx.send(stats);
    }
}
