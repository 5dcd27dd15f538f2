//! Choking algorithm
//!
//! Every round (10 s, driven by the controller's timer) the top four
//! interested peers by transfer rate are unchoked; every third round one
//! additional interested-but-choked peer gets the optimistic slot.
//! Decisions are emitted only for transitions, so choke/unchoke messages
//! go out exactly when state changes.

use std::net::SocketAddr;

/// Per-peer inputs to a choking round.
#[derive(Debug, Clone)]
pub struct PeerChokeInfo {
    pub addr: SocketAddr,
    /// Bytes/sec we download from this peer
    pub download_rate: u64,
    /// Bytes/sec we upload to this peer
    pub upload_rate: u64,
    /// The peer wants our data
    pub peer_interested: bool,
    /// We currently have the peer unchoked
    pub is_unchoked: bool,
}

/// Transition to apply to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeDecision {
    Unchoke(SocketAddr),
    Choke(SocketAddr),
}

/// Round-driven choking state.
pub struct Choker {
    unchoke_slots: usize,
    /// Optimistic slot rotates once per this many rounds
    rounds_per_optimistic: u32,
    round: u32,
    optimistic: Option<SocketAddr>,
    /// Rotation cursor over the candidate list
    rotation: u64,
}

impl Choker {
    pub fn new(unchoke_slots: usize, rounds_per_optimistic: u32) -> Self {
        Self {
            unchoke_slots,
            rounds_per_optimistic: rounds_per_optimistic.max(1),
            round: 0,
            optimistic: None,
            rotation: 0,
        }
    }

    /// Standard configuration: 4 slots, optimistic every 3rd round.
    pub fn standard() -> Self {
        Self::new(4, 3)
    }

    /// The current optimistic unchoke, if any.
    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    /// Forget a departed peer.
    pub fn peer_disconnected(&mut self, addr: SocketAddr) {
        if self.optimistic == Some(addr) {
            self.optimistic = None;
        }
    }

    /// Run one round and return the transitions to apply.
    ///
    /// While downloading, slots go to the peers we download from fastest;
    /// while seeding, to the peers we upload to fastest. Rate ties break
    /// on the address so rounds are reproducible.
    pub fn round(&mut self, peers: &[PeerChokeInfo], seeding: bool) -> Vec<ChokeDecision> {
        self.round = self.round.wrapping_add(1);

        let mut interested: Vec<&PeerChokeInfo> =
            peers.iter().filter(|p| p.peer_interested).collect();

        interested.sort_by(|a, b| {
            let rate = |p: &PeerChokeInfo| if seeding { p.upload_rate } else { p.download_rate };
            rate(b).cmp(&rate(a)).then_with(|| a.addr.cmp(&b.addr))
        });

        let mut unchoked: Vec<SocketAddr> = interested
            .iter()
            .take(self.unchoke_slots)
            .map(|p| p.addr)
            .collect();

        if self.round % self.rounds_per_optimistic == 0 {
            self.rotate_optimistic(&interested, &unchoked);
        }

        // Keep the optimistic peer unchoked while it is still around.
        if let Some(opt) = self.optimistic {
            if peers.iter().any(|p| p.addr == opt) {
                if !unchoked.contains(&opt) {
                    unchoked.push(opt);
                }
            } else {
                self.optimistic = None;
            }
        }

        let mut decisions = Vec::new();

        for peer in peers {
            let should_unchoke = unchoked.contains(&peer.addr);
            if should_unchoke && !peer.is_unchoked {
                decisions.push(ChokeDecision::Unchoke(peer.addr));
            } else if !should_unchoke && peer.is_unchoked {
                decisions.push(ChokeDecision::Choke(peer.addr));
            }
        }

        decisions
    }

    fn rotate_optimistic(&mut self, interested: &[&PeerChokeInfo], unchoked: &[SocketAddr]) {
        let mut candidates: Vec<SocketAddr> = interested
            .iter()
            .filter(|p| !unchoked.contains(&p.addr))
            .map(|p| p.addr)
            .collect();
        candidates.sort();

        if candidates.is_empty() {
            self.optimistic = None;
            return;
        }

        self.rotation = self.rotation.wrapping_add(1);
        self.optimistic = Some(candidates[self.rotation as usize % candidates.len()]);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn info(port: u16, download_rate: u64, interested: bool, unchoked: bool) -> PeerChokeInfo {
        PeerChokeInfo {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            download_rate,
            upload_rate: 0,
            peer_interested: interested,
            is_unchoked: unchoked,
        }
    }

    fn unchoked_ports(decisions: &[ChokeDecision]) -> Vec<u16> {
        decisions
            .iter()
            .filter_map(|d| match d {
                ChokeDecision::Unchoke(addr) => Some(addr.port()),
                _ => None,
            })
            .collect()
    }

    fn choked_ports(decisions: &[ChokeDecision]) -> Vec<u16> {
        decisions
            .iter()
            .filter_map(|d| match d {
                ChokeDecision::Choke(addr) => Some(addr.port()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_top_downloaders_unchoked() {
        let mut choker = Choker::new(2, 1000);
        let peers = vec![
            info(1000, 100, true, false),
            info(1001, 500, true, false),
            info(1002, 300, true, false),
            info(1003, 50, true, false),
        ];

        let decisions = choker.round(&peers, false);
        let unchoked = unchoked_ports(&decisions);
        assert!(unchoked.contains(&1001));
        assert!(unchoked.contains(&1002));
        assert!(!unchoked.contains(&1000));
        assert!(!unchoked.contains(&1003));
    }

    #[test]
    fn test_uninterested_peers_never_unchoked() {
        let mut choker = Choker::new(4, 1000);
        let peers = vec![
            info(1000, 500, true, false),
            info(1001, 1000, false, false),
            info(1002, 300, true, false),
        ];

        let unchoked = unchoked_ports(&choker.round(&peers, false));
        assert!(unchoked.contains(&1000));
        assert!(unchoked.contains(&1002));
        assert!(!unchoked.contains(&1001));
    }

    #[test]
    fn test_transitions_only() {
        let mut choker = Choker::new(1, 1000);
        let peers = vec![info(1000, 500, true, true), info(1001, 100, true, true)];

        let decisions = choker.round(&peers, false);
        // 1000 is already unchoked: no message. 1001 loses its slot.
        assert_eq!(unchoked_ports(&decisions), Vec::<u16>::new());
        assert_eq!(choked_ports(&decisions), vec![1001]);
    }

    #[test]
    fn test_seeding_prefers_upload_rate() {
        let mut choker = Choker::new(1, 1000);
        let mut fast_up = info(1000, 1000, true, false);
        fast_up.upload_rate = 100;
        let mut slow_down = info(1001, 100, true, false);
        slow_down.upload_rate = 1000;

        let unchoked = unchoked_ports(&choker.round(&[fast_up, slow_down], true));
        assert_eq!(unchoked, vec![1001]);
    }

    #[test]
    fn test_optimistic_rotation() {
        // Optimistic every round, one regular slot.
        let mut choker = Choker::new(1, 1);
        let peers = vec![
            info(1000, 500, true, false),
            info(1001, 10, true, false),
            info(1002, 20, true, false),
        ];

        let decisions = choker.round(&peers, false);
        let unchoked = unchoked_ports(&decisions);
        // Top slot plus one optimistic from {1001, 1002}.
        assert!(unchoked.contains(&1000));
        assert_eq!(unchoked.len(), 2);
        let optimistic = choker.optimistic().unwrap();
        assert!(optimistic.port() == 1001 || optimistic.port() == 1002);

        // Rotation eventually covers the other candidate.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            choker.round(&peers, false);
            seen.insert(choker.optimistic().unwrap().port());
        }
        assert!(seen.contains(&1001) && seen.contains(&1002));
    }

    #[test]
    fn test_peer_disconnected_clears_optimistic() {
        let mut choker = Choker::new(0, 1);
        let peers = vec![info(1000, 0, true, false)];
        choker.round(&peers, false);
        let opt = choker.optimistic().unwrap();
        choker.peer_disconnected(opt);
        assert!(choker.optimistic().is_none());
    }
}
