//! Stats snapshot
//!
//! Produced by the controller on every timer round and read synchronously
//! through `Torrent::stats()`. Embedders typically serialize this straight
//! to JSON.

use serde::{Deserialize, Serialize};

/// Engine lifecycle state, as surfaced in stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentState {
    /// Not started, or stopped
    Stopped,
    /// Waiting for the info dictionary (magnet construction)
    Metadata,
    /// Re-verifying resume-claimed pieces
    Verifying,
    /// Fetching pieces
    Downloading,
    /// Complete, serving uploads
    Seeding,
    /// Shutting down sessions
    Stopping,
    /// Closed for good
    Closed,
}

impl TorrentState {
    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Metadata => "metadata",
            Self::Verifying => "verifying",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Stopping => "stopping",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for TorrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    /// Engine state
    pub state: TorrentState,
    /// Total payload bytes downloaded
    pub downloaded: u64,
    /// Total payload bytes uploaded
    pub uploaded: u64,
    /// Bytes still missing
    pub left: u64,
    /// Download rate over the last 10 s (bytes/sec)
    pub download_rate: u64,
    /// Upload rate over the last 10 s (bytes/sec)
    pub upload_rate: u64,
    /// Connected peer count
    pub peers: usize,
    /// Verified piece count
    pub pieces_complete: usize,
    /// Total piece count
    pub pieces_total: usize,
    /// Port the acceptor is bound to (0 until started)
    pub listen_port: u16,
}

impl Stats {
    /// An initial snapshot for a torrent of `pieces_total` pieces and
    /// `total_size` bytes.
    pub fn initial(pieces_total: usize, total_size: u64) -> Self {
        Self {
            state: TorrentState::Stopped,
            downloaded: 0,
            uploaded: 0,
            left: total_size,
            download_rate: 0,
            upload_rate: 0,
            peers: 0,
            pieces_complete: 0,
            pieces_total,
            listen_port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_labels() {
        assert_eq!(TorrentState::Downloading.label(), "downloading");
        assert_eq!(TorrentState::Seeding.to_string(), "seeding");
    }

    #[test]
    fn test_stats_serialize() {
        let stats = Stats::initial(10, 160 * 1024);
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"state\":\"stopped\""));
        assert!(json.contains("\"pieces_total\":10"));

        let back: Stats = serde_json::from_str(&json).unwrap();
        assert_eq!(back.left, 160 * 1024);
    }
}
