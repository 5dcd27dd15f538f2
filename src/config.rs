//! Engine configuration
//!
//! All protocol tunables in one typed value, passed at construction. The
//! engine keeps no process-global configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a torrent engine instance.
///
/// `Default` produces the standard protocol constants; embedders normally
/// tweak only `max_peers` and the intervals when testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum number of connected peers (default 200)
    pub max_peers: usize,
    /// Maximum simultaneous half-open outbound connections (default 50)
    pub max_half_open: usize,
    /// Per-peer floor on outstanding block requests (default 4)
    pub min_requests_per_peer: usize,
    /// Per-peer ceiling on outstanding block requests (default 250)
    pub max_requests_per_peer: usize,
    /// TCP connect timeout for outbound dials
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Handshake exchange deadline
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// Send a keepalive after this much outbound silence
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    /// Disconnect a peer after this much inbound silence
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// HTTP announce timeout
    #[serde(with = "duration_secs")]
    pub announce_timeout: Duration,
    /// Choking algorithm round interval
    #[serde(with = "duration_secs")]
    pub choke_interval: Duration,
    /// Optimistic unchoke rotation interval
    #[serde(with = "duration_secs")]
    pub optimistic_interval: Duration,
    /// Resume record flush interval
    #[serde(with = "duration_secs")]
    pub resume_interval: Duration,
    /// Request allocator tick
    #[serde(with = "duration_millis")]
    pub allocator_tick: Duration,
    /// Minimum backoff before re-trying a failed tracker tier
    #[serde(with = "duration_secs")]
    pub tracker_backoff: Duration,
    /// Bound on the best-effort stopped announce and final resume flush
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    /// Disconnect and ban a peer after this many bad pieces
    pub max_bad_pieces: u32,
    /// Fatal after this many consecutive announce rounds yielding no peers
    pub max_barren_announces: u32,
    /// Fatal requires the peer count at zero for at least this long
    #[serde(with = "duration_secs")]
    pub peerless_fatal_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 200,
            max_half_open: 50,
            min_requests_per_peer: 4,
            max_requests_per_peer: 250,
            connect_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(180),
            announce_timeout: Duration::from_secs(30),
            choke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            resume_interval: Duration::from_secs(30),
            allocator_tick: Duration::from_millis(250),
            tracker_backoff: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            max_bad_pieces: 3,
            max_barren_announces: 8,
            peerless_fatal_after: Duration::from_secs(600),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        let config = Config::default();
        assert_eq!(config.max_peers, 200);
        assert_eq!(config.max_half_open, 50);
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(180));
        assert_eq!(config.choke_interval, Duration::from_secs(10));
        assert_eq!(config.max_bad_pieces, 3);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_peers, config.max_peers);
        assert_eq!(back.allocator_tick, config.allocator_tick);
        assert_eq!(back.peerless_fatal_after, config.peerless_fatal_after);
    }
}
