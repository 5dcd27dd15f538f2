//! Test helpers
//!
//! Builders for deterministic torrent metadata and piece data, plus an
//! engine configuration with intervals short enough for tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tidal::{Config, Info};

/// Deterministic piece payloads for a torrent of `total_size` bytes.
pub fn make_piece_data(piece_length: usize, total_size: usize) -> Vec<Vec<u8>> {
    let content: Vec<u8> = (0..total_size).map(|i| (i % 251) as u8).collect();
    content
        .chunks(piece_length)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Build a single-file `Info` whose hash table matches `piece_data`.
pub fn build_info(name: &str, piece_length: u64, piece_data: &[Vec<u8>]) -> Info {
    let total: u64 = piece_data.iter().map(|p| p.len() as u64).sum();

    let hashes: Vec<[u8; 20]> = piece_data
        .iter()
        .map(|data| {
            let mut hasher = Sha1::new();
            hasher.update(data);
            hasher.finalize().into()
        })
        .collect();

    // A synthetic but stable infohash derived from the content.
    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    for hash in &hashes {
        hasher.update(hash);
    }
    let info_hash: [u8; 20] = hasher.finalize().into();

    Info::new(
        info_hash,
        name,
        piece_length,
        hashes,
        vec![(PathBuf::from(name), total)],
        false,
    )
    .expect("test info must be valid")
}

/// Engine configuration with intervals scaled down for tests.
pub fn test_config() -> Config {
    Config {
        max_peers: 10,
        allocator_tick: Duration::from_millis(25),
        choke_interval: Duration::from_millis(500),
        optimistic_interval: Duration::from_millis(1500),
        resume_interval: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        announce_timeout: Duration::from_secs(5),
        tracker_backoff: Duration::from_millis(500),
        shutdown_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

/// Poll `predicate` until it holds or `deadline` elapses.
pub async fn wait_until<F: FnMut() -> bool>(deadline: Duration, mut predicate: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
