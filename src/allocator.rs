//! Request allocation
//!
//! Decides which block of which piece to request from which peer.
//! Rarest-first over missing pieces with deterministic tie-breaks, a
//! per-peer outstanding cap supplied by the caller, and an end-game mode
//! that allows bounded redundant requests near completion.
//!
//! The allocator is pure bookkeeping: it never performs I/O and is driven
//! entirely by the controller's event loop, which owns it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::bitfield::Bitfield;
use crate::metainfo::Info;
use crate::piece::BLOCK_SIZE;

/// Redundancy bound per block in end-game mode.
const ENDGAME_MAX_ASSIGNEES: usize = 3;

/// End-game engages when fewer than this many blocks remain unassigned.
const ENDGAME_BLOCK_THRESHOLD: usize = 20;

/// Pieces skipped from the front of the candidate order while the swarm is
/// still small, so early peers do not all converge on the same pieces.
const FEW_PEERS_SKIP: usize = 4;
const FEW_PEERS_THRESHOLD: usize = 4;

/// A block to request from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// Piece index
    pub piece: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Block length
    pub length: u32,
}

/// What happened when a block arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReceipt {
    /// The block had already been received from another peer; discard it.
    pub duplicate: bool,
    /// Every block of the piece has now been received.
    pub piece_complete: bool,
    /// Peers holding now-redundant assignments for this block (send CANCEL).
    pub cancel_peers: Vec<SocketAddr>,
}

#[derive(Debug)]
enum PieceState {
    Missing,
    InFlight(InFlight),
    Present,
}

#[derive(Debug)]
struct InFlight {
    blocks: Vec<BlockState>,
    received: usize,
}

#[derive(Debug, Clone)]
enum BlockState {
    Unassigned,
    Assigned(Vec<SocketAddr>),
    Received,
}

/// Rarest-first block allocator.
pub struct RequestAllocator {
    info: Arc<Info>,
    pieces: Vec<PieceState>,
    /// How many connected peers advertise each piece
    availability: Vec<u32>,
    /// Blocks assigned to each peer, for requeue on choke or death
    assigned: HashMap<SocketAddr, HashSet<(u32, u32)>>,
    present_count: usize,
}

impl RequestAllocator {
    pub fn new(info: Arc<Info>) -> Self {
        let n = info.num_pieces();
        Self {
            info,
            pieces: (0..n).map(|_| PieceState::Missing).collect(),
            availability: vec![0; n],
            assigned: HashMap::new(),
            present_count: 0,
        }
    }

    fn block_count(&self, piece: u32) -> u32 {
        self.info
            .piece_len(piece as usize)
            .map(|len| len.div_ceil(BLOCK_SIZE as u64) as u32)
            .unwrap_or(0)
    }

    fn block_length(&self, piece: u32, block: u32) -> u32 {
        let piece_len = self.info.piece_len(piece as usize).unwrap_or(0);
        let offset = block as u64 * BLOCK_SIZE as u64;
        (piece_len.saturating_sub(offset)).min(BLOCK_SIZE as u64) as u32
    }

    /// Number of verified pieces.
    pub fn present_count(&self) -> usize {
        self.present_count
    }

    /// True once every piece is present.
    pub fn is_complete(&self) -> bool {
        self.present_count == self.pieces.len()
    }

    /// True if the peer advertises any piece we still lack.
    pub fn peer_has_needed(&self, peer_has: &Bitfield) -> bool {
        self.pieces
            .iter()
            .enumerate()
            .any(|(i, state)| !matches!(state, PieceState::Present) && peer_has.test(i))
    }

    /// Mark a piece present without downloading (resume re-verification).
    pub fn mark_present(&mut self, piece: u32) {
        let idx = piece as usize;
        if idx < self.pieces.len() && !matches!(self.pieces[idx], PieceState::Present) {
            self.pieces[idx] = PieceState::Present;
            self.present_count += 1;
        }
    }

    /// Fold a whole remote bitfield into the availability counts.
    pub fn peer_connected(&mut self, peer_has: &Bitfield) {
        for i in peer_has.iter_set() {
            if let Some(a) = self.availability.get_mut(i) {
                *a = a.saturating_add(1);
            }
        }
    }

    /// A connected peer announced one more piece.
    pub fn peer_has(&mut self, piece: u32) {
        if let Some(a) = self.availability.get_mut(piece as usize) {
            *a = a.saturating_add(1);
        }
    }

    /// Remove a departing peer: drop its availability contribution and
    /// requeue its outstanding blocks.
    pub fn peer_disconnected(&mut self, peer: SocketAddr, peer_had: &Bitfield) {
        for i in peer_had.iter_set() {
            if let Some(a) = self.availability.get_mut(i) {
                *a = a.saturating_sub(1);
            }
        }
        self.release_assignments(peer);
    }

    /// The peer choked us: its in-flight requests are void, requeue them.
    pub fn peer_choked(&mut self, peer: SocketAddr) {
        self.release_assignments(peer);
    }

    fn release_assignments(&mut self, peer: SocketAddr) {
        let Some(blocks) = self.assigned.remove(&peer) else {
            return;
        };
        for (piece, block) in blocks {
            if let Some(PieceState::InFlight(fl)) = self.pieces.get_mut(piece as usize) {
                if let Some(BlockState::Assigned(peers)) = fl.blocks.get_mut(block as usize) {
                    peers.retain(|p| *p != peer);
                    if peers.is_empty() {
                        fl.blocks[block as usize] = BlockState::Unassigned;
                    }
                }
            }
        }
    }

    /// Outstanding request count for a peer.
    pub fn outstanding(&self, peer: SocketAddr) -> usize {
        self.assigned.get(&peer).map(|s| s.len()).unwrap_or(0)
    }

    /// Per-peer outstanding cap from the observed download rate:
    /// `max(4, min(250, rate / BLOCK_SIZE))`, bounds taken from config.
    pub fn request_cap(rate_bytes_per_sec: u64, floor: usize, ceiling: usize) -> usize {
        let by_rate = (rate_bytes_per_sec as f64 / BLOCK_SIZE as f64).round() as usize;
        by_rate.clamp(floor, ceiling)
    }

    /// True when end-game rules apply: nothing is Missing and fewer than
    /// the threshold of blocks remain unassigned.
    pub fn in_endgame(&self) -> bool {
        let mut unassigned = 0usize;
        for state in &self.pieces {
            match state {
                PieceState::Missing => return false,
                PieceState::InFlight(fl) => {
                    unassigned += fl
                        .blocks
                        .iter()
                        .filter(|b| matches!(b, BlockState::Unassigned))
                        .count();
                }
                PieceState::Present => {}
            }
        }
        !self.is_complete() && unassigned < ENDGAME_BLOCK_THRESHOLD
    }

    /// Pick up to `capacity` blocks to request from `peer`.
    ///
    /// Strict mode keeps assignments injective across peers. In end-game,
    /// blocks already assigned elsewhere may be handed out again, up to
    /// three assignees per block. Ordering is deterministic throughout.
    pub fn next_requests(
        &mut self,
        peer: SocketAddr,
        peer_has: &Bitfield,
        capacity: usize,
        connected_peers: usize,
    ) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        if capacity == 0 {
            return out;
        }

        // First finish pieces already in flight that this peer can serve.
        for piece in 0..self.pieces.len() as u32 {
            if out.len() >= capacity {
                return out;
            }
            if !peer_has.test(piece as usize) {
                continue;
            }
            if matches!(self.pieces[piece as usize], PieceState::InFlight(_)) {
                self.take_blocks(peer, piece, capacity, &mut out);
            }
        }

        // Then open new pieces, rarest first.
        while out.len() < capacity {
            let Some(piece) = self.pick_missing(peer_has, connected_peers) else {
                break;
            };
            let blocks = self.block_count(piece) as usize;
            self.pieces[piece as usize] = PieceState::InFlight(InFlight {
                blocks: vec![BlockState::Unassigned; blocks],
                received: 0,
            });
            self.take_blocks(peer, piece, capacity, &mut out);
        }

        // End-game: double up on the stragglers.
        if out.len() < capacity && self.in_endgame() {
            self.take_endgame_blocks(peer, peer_has, capacity, &mut out);
        }

        out
    }

    /// Rarest-first selection over Missing pieces the peer advertises.
    /// Ties break on ascending piece index.
    fn pick_missing(&self, peer_has: &Bitfield, connected_peers: usize) -> Option<u32> {
        let mut candidates: Vec<(u32, u32)> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(i, state)| matches!(state, PieceState::Missing) && peer_has.test(*i))
            .map(|(i, _)| (self.availability[i], i as u32))
            .collect();

        candidates.sort_unstable();

        // With few peers connected, skip the front of the order so the
        // whole swarm does not pile onto the same pieces. Inert when the
        // skip would leave nothing to pick.
        let skip = if connected_peers < FEW_PEERS_THRESHOLD && candidates.len() > FEW_PEERS_SKIP {
            FEW_PEERS_SKIP
        } else {
            0
        };

        candidates.get(skip).map(|&(_, index)| index)
    }

    fn take_blocks(
        &mut self,
        peer: SocketAddr,
        piece: u32,
        capacity: usize,
        out: &mut Vec<BlockRequest>,
    ) {
        let block_lengths: Vec<u32> = (0..self.block_count(piece))
            .map(|b| self.block_length(piece, b))
            .collect();

        let PieceState::InFlight(fl) = &mut self.pieces[piece as usize] else {
            return;
        };

        for (block, state) in fl.blocks.iter_mut().enumerate() {
            if out.len() >= capacity {
                return;
            }
            if matches!(state, BlockState::Unassigned) {
                *state = BlockState::Assigned(vec![peer]);
                self.assigned
                    .entry(peer)
                    .or_default()
                    .insert((piece, block as u32));
                out.push(BlockRequest {
                    piece,
                    offset: block as u32 * BLOCK_SIZE,
                    length: block_lengths[block],
                });
            }
        }
    }

    fn take_endgame_blocks(
        &mut self,
        peer: SocketAddr,
        peer_has: &Bitfield,
        capacity: usize,
        out: &mut Vec<BlockRequest>,
    ) {
        for piece in 0..self.pieces.len() as u32 {
            if !peer_has.test(piece as usize) {
                continue;
            }
            let block_lengths: Vec<u32> = (0..self.block_count(piece))
                .map(|b| self.block_length(piece, b))
                .collect();

            let PieceState::InFlight(fl) = &mut self.pieces[piece as usize] else {
                continue;
            };

            for (block, state) in fl.blocks.iter_mut().enumerate() {
                if out.len() >= capacity {
                    return;
                }
                if let BlockState::Assigned(peers) = state {
                    if peers.len() < ENDGAME_MAX_ASSIGNEES && !peers.contains(&peer) {
                        peers.push(peer);
                        self.assigned
                            .entry(peer)
                            .or_default()
                            .insert((piece, block as u32));
                        out.push(BlockRequest {
                            piece,
                            offset: block as u32 * BLOCK_SIZE,
                            length: block_lengths[block],
                        });
                    }
                }
            }
        }
    }

    /// Record an arrived block.
    ///
    /// Duplicate end-game arrivals are flagged so the caller discards the
    /// payload; the remaining assignees are returned for CANCELing.
    pub fn block_received(&mut self, peer: SocketAddr, piece: u32, offset: u32) -> BlockReceipt {
        let block = offset / BLOCK_SIZE;

        if let Some(set) = self.assigned.get_mut(&peer) {
            set.remove(&(piece, block));
        }

        let Some(PieceState::InFlight(fl)) = self.pieces.get_mut(piece as usize) else {
            // Piece already verified or reset; late arrival.
            return BlockReceipt {
                duplicate: true,
                piece_complete: false,
                cancel_peers: Vec::new(),
            };
        };

        let Some(state) = fl.blocks.get_mut(block as usize) else {
            return BlockReceipt {
                duplicate: true,
                piece_complete: false,
                cancel_peers: Vec::new(),
            };
        };

        match std::mem::replace(state, BlockState::Received) {
            BlockState::Received => {
                // First arrival already won; keep the state and drop this one.
                BlockReceipt {
                    duplicate: true,
                    piece_complete: false,
                    cancel_peers: Vec::new(),
                }
            }
            BlockState::Assigned(peers) => {
                fl.received += 1;
                let cancel_peers: Vec<SocketAddr> =
                    peers.into_iter().filter(|p| *p != peer).collect();
                for other in &cancel_peers {
                    if let Some(set) = self.assigned.get_mut(other) {
                        set.remove(&(piece, block));
                    }
                }
                BlockReceipt {
                    duplicate: false,
                    piece_complete: fl.received == fl.blocks.len(),
                    cancel_peers,
                }
            }
            BlockState::Unassigned => {
                // Unsolicited but valid block; accept it.
                fl.received += 1;
                BlockReceipt {
                    duplicate: false,
                    piece_complete: fl.received == fl.blocks.len(),
                    cancel_peers: Vec::new(),
                }
            }
        }
    }

    /// Hash verification succeeded: the piece is present for good.
    pub fn piece_verified(&mut self, piece: u32) {
        let idx = piece as usize;
        if idx < self.pieces.len() && !matches!(self.pieces[idx], PieceState::Present) {
            self.pieces[idx] = PieceState::Present;
            self.present_count += 1;
        }
    }

    /// Hash verification failed: back to Missing with a cleared block map.
    pub fn piece_failed(&mut self, piece: u32) {
        let idx = piece as usize;
        if idx < self.pieces.len() && matches!(self.pieces[idx], PieceState::InFlight(_)) {
            for set in self.assigned.values_mut() {
                set.retain(|(p, _)| *p != piece);
            }
            self.pieces[idx] = PieceState::Missing;
        }
    }
}
