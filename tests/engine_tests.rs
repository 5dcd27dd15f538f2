//! Engine integration tests
//!
//! End-to-end scenarios driven through the public `Torrent` API against
//! in-process mock peers and a mock HTTP tracker: plain downloads, hash
//! mismatch recovery, end-game cancels, resume across restarts, tracker
//! tier failover, and stop/close behavior.

mod mock_peer;
mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tidal::tracker::{AnnounceEvent, AnnounceRequest, TrackerSet};
use tidal::{
    Bitfield, MemoryResume, MemoryStorage, Resume, ResumeRecord, Storage, Torrent, TorrentState,
};
use tokio::time::timeout;

use mock_peer::{MockPeer, MockPeerConfig};
use mock_tracker::MockTracker;
use support::{build_info, make_piece_data, test_config, wait_until};

const PIECE_LEN: usize = 16 * 1024;
const COMPLETION_DEADLINE: Duration = Duration::from_secs(15);

/// Spin up a torrent wired to the given seeders through a mock tracker.
async fn start_torrent(
    name: &str,
    piece_data: &[Vec<u8>],
    seeders: &[&Arc<MockPeer>],
) -> (Torrent, Arc<MemoryStorage>) {
    let info = build_info(name, PIECE_LEN as u64, piece_data);
    let storage = Arc::new(MemoryStorage::new(info.piece_length, info.total_size));

    let peers = seeders.iter().map(|s| s.addr()).collect();
    let tracker = MockTracker::start(peers, 1800).await.unwrap();

    let torrent = Torrent::with_config(
        info,
        0,
        Arc::clone(&storage) as Arc<dyn tidal::Storage>,
        vec![vec![tracker.url()]],
        test_config(),
    )
    .unwrap();
    torrent.start().await;

    (torrent, storage)
}

// =============================================================================
// Scenario: single-peer download
// =============================================================================

#[tokio::test]
async fn single_peer_download_completes() {
    // Two full pieces and one 8 KiB piece, 40 KiB total.
    let piece_data = make_piece_data(PIECE_LEN, 40 * 1024);
    assert_eq!(piece_data.len(), 3);

    let info = build_info("single-peer", PIECE_LEN as u64, &piece_data);
    let seeder = MockPeer::start(
        MockPeerConfig::new(info.info_hash, piece_data.len()).with_pieces(&piece_data),
    )
    .await
    .unwrap();

    let (torrent, storage) = start_torrent("single-peer", &piece_data, &[&seeder]).await;

    timeout(COMPLETION_DEADLINE, torrent.notify_complete())
        .await
        .expect("download should complete");

    let stats = torrent.stats();
    assert_eq!(stats.pieces_complete, 3);
    assert_eq!(stats.state, TorrentState::Seeding);
    assert_eq!(stats.downloaded, 40 * 1024);
    assert_eq!(stats.left, 0);

    // Exactly three block requests: 16 KiB + 16 KiB + 8 KiB.
    let mut lengths: Vec<u32> = seeder.requests().iter().map(|r| r.2).collect();
    lengths.sort_unstable();
    assert_eq!(lengths, vec![8 * 1024, 16 * 1024, 16 * 1024]);

    // Storage holds exactly the seeded bytes.
    for (i, data) in piece_data.iter().enumerate() {
        let stored = storage.read(i as u32, 0, data.len() as u32).await.unwrap();
        assert_eq!(&stored, data, "piece {} content", i);
    }

    torrent.close().await;
}

// =============================================================================
// Scenario: hash mismatch and re-request
// =============================================================================

#[tokio::test]
async fn corrupted_piece_is_rerequested() {
    let piece_data = make_piece_data(PIECE_LEN, 40 * 1024);
    let info = build_info("hash-mismatch", PIECE_LEN as u64, &piece_data);

    // The peer flips one bit in piece 1's final (only) block, once.
    let seeder = MockPeer::start(
        MockPeerConfig::new(info.info_hash, piece_data.len())
            .with_pieces(&piece_data)
            .with_corrupt_block(1, 0),
    )
    .await
    .unwrap();

    let (torrent, storage) = start_torrent("hash-mismatch", &piece_data, &[&seeder]).await;

    timeout(COMPLETION_DEADLINE, torrent.notify_complete())
        .await
        .expect("download should recover from the bad piece");

    // Piece 1 went out twice: corrupted, then clean.
    let piece1_requests = seeder.requests().iter().filter(|r| r.0 == 1).count();
    assert!(
        piece1_requests >= 2,
        "piece 1 should be re-requested, saw {} requests",
        piece1_requests
    );

    // Final bytes are the correct ones.
    let stored = storage.read(1, 0, piece_data[1].len() as u32).await.unwrap();
    assert_eq!(stored, piece_data[1]);

    torrent.close().await;
}

// =============================================================================
// Scenario: end-game redundancy and cancels
// =============================================================================

#[tokio::test]
async fn endgame_duplicates_and_cancels() {
    // Ten single-block pieces: few enough blocks that end-game rules
    // apply as soon as everything is assigned.
    let piece_data = make_piece_data(PIECE_LEN, 10 * PIECE_LEN);
    let info = build_info("endgame", PIECE_LEN as u64, &piece_data);

    let mut seeders = Vec::new();
    for _ in 0..3 {
        let seeder = MockPeer::start(
            MockPeerConfig::new(info.info_hash, piece_data.len())
                .with_pieces(&piece_data)
                .with_serve_delay(Duration::from_millis(300)),
        )
        .await
        .unwrap();
        seeders.push(seeder);
    }

    let seeder_refs: Vec<&Arc<MockPeer>> = seeders.iter().collect();
    let (torrent, _storage) = start_torrent("endgame", &piece_data, &seeder_refs).await;

    timeout(COMPLETION_DEADLINE, torrent.notify_complete())
        .await
        .expect("download should complete with slow peers");

    // Some block was assigned redundantly across peers...
    let mut per_block: HashMap<(u32, u32), usize> = HashMap::new();
    for seeder in &seeders {
        for (piece, offset, _) in seeder.requests() {
            *per_block.entry((piece, offset)).or_insert(0) += 1;
        }
    }
    assert!(
        per_block.values().any(|&count| count >= 2),
        "end-game should hand the same block to more than one peer"
    );
    // ...but never to more than three.
    assert!(
        per_block.values().all(|&count| count <= 3),
        "no block may be assigned to more than three peers"
    );

    // The winners' duplicates were CANCELed.
    let cancels_seen = wait_until(Duration::from_secs(5), || {
        seeders.iter().any(|s| !s.cancels().is_empty())
    })
    .await;
    assert!(cancels_seen, "redundant assignments should be CANCELed");

    torrent.close().await;
}

// =============================================================================
// Scenario: resume across restart
// =============================================================================

#[tokio::test]
async fn resume_reverifies_and_continues() {
    let piece_data = make_piece_data(PIECE_LEN, 10 * PIECE_LEN);
    let info = build_info("resume", PIECE_LEN as u64, &piece_data);
    let info_hash = info.info_hash;

    let storage = Arc::new(MemoryStorage::new(info.piece_length, info.total_size));
    let resume = Arc::new(MemoryResume::new());

    // Pieces 0..=4 are already on disk and valid; the record also claims
    // piece 5, whose on-disk bytes are wrong and must be re-fetched.
    for (i, data) in piece_data.iter().enumerate().take(5) {
        storage.write(i as u32, 0, data).await.unwrap();
    }
    storage
        .write(5, 0, &vec![0u8; piece_data[5].len()])
        .await
        .unwrap();

    let mut claimed = Bitfield::new(10);
    for i in 0..=5 {
        claimed.set(i);
    }
    resume
        .save(&ResumeRecord {
            info_hash,
            downloaded: 5 * PIECE_LEN as u64,
            uploaded: 0,
            bitfield: claimed.snapshot(),
        })
        .await
        .unwrap();

    let seeder =
        MockPeer::start(MockPeerConfig::new(info_hash, piece_data.len()).with_pieces(&piece_data))
            .await
            .unwrap();
    let tracker = MockTracker::start(vec![seeder.addr()], 1800).await.unwrap();

    let torrent = Torrent::with_config(
        info.clone(),
        0,
        Arc::clone(&storage) as Arc<dyn tidal::Storage>,
        vec![vec![tracker.url()]],
        test_config(),
    )
    .unwrap();
    torrent
        .set_resume(Arc::clone(&resume) as Arc<dyn Resume>)
        .await
        .unwrap();
    torrent.start().await;

    timeout(COMPLETION_DEADLINE, torrent.notify_complete())
        .await
        .expect("remaining pieces should download");

    // Verified pieces were not re-downloaded; the corrupt claim was.
    let requested = seeder.requested_pieces();
    assert_eq!(requested, vec![5, 6, 7, 8, 9]);
    torrent.close().await;

    // A fresh engine over the same storage and resume record reaches
    // completion by re-verification alone, with no peers at all.
    let torrent2 = Torrent::with_config(
        info,
        0,
        Arc::clone(&storage) as Arc<dyn tidal::Storage>,
        Vec::new(),
        test_config(),
    )
    .unwrap();
    torrent2
        .set_resume(Arc::clone(&resume) as Arc<dyn Resume>)
        .await
        .unwrap();
    torrent2.start().await;

    timeout(COMPLETION_DEADLINE, torrent2.notify_complete())
        .await
        .expect("resumed torrent should verify to completion");

    let stats = torrent2.stats();
    assert_eq!(stats.pieces_complete, 10);
    assert_eq!(stats.state, TorrentState::Seeding);
    torrent2.close().await;
}

#[tokio::test]
async fn resume_record_for_other_torrent_is_ignored() {
    let piece_data = make_piece_data(PIECE_LEN, 2 * PIECE_LEN);
    let info = build_info("resume-mismatch", PIECE_LEN as u64, &piece_data);

    let storage = Arc::new(MemoryStorage::new(info.piece_length, info.total_size));
    let resume = Arc::new(MemoryResume::new());
    resume
        .save(&ResumeRecord {
            info_hash: [0xEE; 20],
            downloaded: 999,
            uploaded: 999,
            bitfield: Bitfield::new(2).snapshot(),
        })
        .await
        .unwrap();

    let torrent = Torrent::with_config(
        info,
        0,
        Arc::clone(&storage) as Arc<dyn tidal::Storage>,
        Vec::new(),
        test_config(),
    )
    .unwrap();
    torrent
        .set_resume(Arc::clone(&resume) as Arc<dyn Resume>)
        .await
        .unwrap();
    torrent.start().await;

    let settled = wait_until(Duration::from_secs(5), || {
        torrent.stats().state == TorrentState::Downloading
    })
    .await;
    assert!(settled, "mismatched record must not mark pieces present");
    assert_eq!(torrent.stats().pieces_complete, 0);
    assert_eq!(torrent.stats().downloaded, 0);

    torrent.close().await;
}

// =============================================================================
// Scenario: tracker tier failover (BEP 12)
// =============================================================================

#[tokio::test]
async fn tracker_tier_failover_and_promotion() {
    let bad = MockTracker::start_failing().await.unwrap();
    let good = MockTracker::start(Vec::new(), 60).await.unwrap();

    let set = TrackerSet::new(
        vec![vec![bad.url()], vec![good.url()]],
        Duration::from_secs(5),
    )
    .unwrap();

    let request = AnnounceRequest {
        info_hash: [0x42; 20],
        peer_id: [0x24; 20],
        port: 6881,
        uploaded: 0,
        downloaded: 0,
        left: 1024,
        event: AnnounceEvent::Started,
        numwant: 50,
    };

    // First announce walks tier 0 (fails) and lands on tier 1.
    set.announce(&request).await.unwrap();
    assert_eq!(bad.hits(), 1);
    assert_eq!(good.hits(), 1);

    // The responder is remembered: the second announce skips tier 0.
    set.announce(&request).await.unwrap();
    assert_eq!(bad.hits(), 1, "failed tier must not be retried first");
    assert_eq!(good.hits(), 2);
}

// =============================================================================
// Scenario: stop during download
// =============================================================================

#[tokio::test]
async fn stop_drains_peers_within_bound() {
    let piece_data = make_piece_data(PIECE_LEN, 10 * PIECE_LEN);
    let info = build_info("stop-test", PIECE_LEN as u64, &piece_data);

    // Slow enough that requests stay in flight when we stop.
    let seeder = MockPeer::start(
        MockPeerConfig::new(info.info_hash, piece_data.len())
            .with_pieces(&piece_data)
            .with_serve_delay(Duration::from_millis(500)),
    )
    .await
    .unwrap();

    let (torrent, _storage) = start_torrent("stop-test", &piece_data, &[&seeder]).await;

    let busy = wait_until(Duration::from_secs(10), || {
        torrent.stats().peers >= 1 && seeder.requests().len() >= 3
    })
    .await;
    assert!(busy, "requests should be in flight before stopping");

    torrent.stop().await;

    let drained = wait_until(Duration::from_secs(5), || {
        let stats = torrent.stats();
        stats.peers == 0 && stats.state == TorrentState::Stopped
    })
    .await;
    assert!(drained, "stop must drain all peers within five seconds");

    torrent.close().await;
}

// =============================================================================
// Lifecycle idempotence
// =============================================================================

#[tokio::test]
async fn close_is_idempotent() {
    let piece_data = make_piece_data(PIECE_LEN, PIECE_LEN);
    let info = build_info("close-twice", PIECE_LEN as u64, &piece_data);
    let storage = Arc::new(MemoryStorage::new(info.piece_length, info.total_size));

    let torrent = Torrent::with_config(
        info,
        0,
        storage as Arc<dyn tidal::Storage>,
        Vec::new(),
        test_config(),
    )
    .unwrap();
    torrent.start().await;

    torrent.close().await;
    torrent.close().await;
    assert_eq!(torrent.stats().state, TorrentState::Closed);

    // Every public operation is a clean no-op after close.
    torrent.start().await;
    torrent.stop().await;
    assert_eq!(torrent.stats().state, TorrentState::Closed);
    assert!(torrent
        .set_resume(Arc::new(MemoryResume::new()) as Arc<dyn Resume>)
        .await
        .is_err());
}

#[tokio::test]
async fn stop_then_start_downloads_again() {
    let piece_data = make_piece_data(PIECE_LEN, 3 * PIECE_LEN);
    let info = build_info("restart", PIECE_LEN as u64, &piece_data);

    let seeder = MockPeer::start(
        MockPeerConfig::new(info.info_hash, piece_data.len()).with_pieces(&piece_data),
    )
    .await
    .unwrap();

    let (torrent, _storage) = start_torrent("restart", &piece_data, &[&seeder]).await;

    torrent.stop().await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            torrent.stats().state == TorrentState::Stopped
        })
        .await
    );

    torrent.start().await;
    timeout(COMPLETION_DEADLINE, torrent.notify_complete())
        .await
        .expect("restarted torrent should complete");

    assert_eq!(torrent.stats().pieces_complete, 3);
    torrent.close().await;
}

#[tokio::test]
async fn double_start_is_idempotent() {
    let piece_data = make_piece_data(PIECE_LEN, 3 * PIECE_LEN);
    let info = build_info("double-start", PIECE_LEN as u64, &piece_data);

    let seeder = MockPeer::start(
        MockPeerConfig::new(info.info_hash, piece_data.len()).with_pieces(&piece_data),
    )
    .await
    .unwrap();

    let (torrent, _storage) = start_torrent("double-start", &piece_data, &[&seeder]).await;
    torrent.start().await; // second start is a no-op

    timeout(COMPLETION_DEADLINE, torrent.notify_complete())
        .await
        .expect("download should complete");
    assert_eq!(torrent.stats().pieces_complete, 3);

    torrent.close().await;
}

// =============================================================================
// Magnet construction
// =============================================================================

#[tokio::test]
async fn magnet_engine_waits_for_info() {
    let storage = Arc::new(MemoryStorage::new(PIECE_LEN as u64, PIECE_LEN as u64));
    let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=pending";

    let torrent = Torrent::new_magnet(uri, 0, storage as Arc<dyn tidal::Storage>).unwrap();
    torrent.start().await;

    let in_metadata = wait_until(Duration::from_secs(5), || {
        torrent.stats().state == TorrentState::Metadata
    })
    .await;
    assert!(in_metadata, "magnet engine idles in the metadata state");
    assert_eq!(torrent.stats().pieces_total, 0);

    // Handing over a dictionary with the wrong hash is rejected.
    let piece_data = make_piece_data(PIECE_LEN, PIECE_LEN);
    let wrong = build_info("wrong-hash", PIECE_LEN as u64, &piece_data);
    assert!(torrent.set_info(wrong).await.is_err());

    torrent.close().await;
}
