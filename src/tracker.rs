//! Tracker communication
//!
//! HTTP (BEP 3) and UDP (BEP 15) announce clients behind the BEP 12
//! failover structure: trackers are grouped into tiers, each tier is tried
//! in randomized order, and the first tracker to respond is promoted to
//! the front of its tier for subsequent announces.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::bencode::BencodeValue;
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Magic constant for the UDP tracker protocol
const UDP_PROTOCOL_ID: i64 = 0x41727101980;

/// BEP 15 retransmit schedule: timeout is 15 * 2^n seconds for n = 0..=8.
const UDP_MAX_RETRIES: u32 = 8;

/// Minimum allowed announce interval
const MIN_ANNOUNCE_INTERVAL: u64 = 60;

/// Maximum allowed announce interval
const MAX_ANNOUNCE_INTERVAL: u64 = 3600;

/// Announce event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Regular re-announce
    None,
    /// First announce of this run
    Started,
    /// Engine is stopping
    Stopped,
    /// Bitfield reached full for the first time
    Completed,
}

impl AnnounceEvent {
    fn http_value(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    fn udp_value(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// Announce request parameters
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    /// Port we accept peers on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    /// Number of peers to request
    pub numwant: u32,
}

/// Announce response from a tracker
#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    /// Re-announce interval, already clamped to [60 s, 3600 s]
    pub interval: Duration,
    /// Tracker-imposed lower bound on the interval
    pub min_interval: Option<Duration>,
    /// Seeder count, when reported
    pub complete: Option<u32>,
    /// Leecher count, when reported
    pub incomplete: Option<u32>,
    /// Peers to try
    pub peers: Vec<PeerAddr>,
}

impl AnnounceResponse {
    /// Effective wait before the next announce.
    pub fn next_announce_in(&self) -> Duration {
        match self.min_interval {
            Some(min) if min > self.interval => min,
            _ => self.interval,
        }
    }
}

/// Peer address from a tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// IP address or hostname
    pub ip: String,
    pub port: u16,
    /// Peer ID when the tracker reports one (dict format only)
    pub peer_id: Option<[u8; 20]>,
}

impl PeerAddr {
    /// Resolve to a socket address.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        (self.ip.as_str(), self.port)
            .to_socket_addrs()
            .ok()?
            .next()
    }
}

/// Generate an Azureus-style peer ID: `-TD0001-` plus 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-TD0001-");
    rand::rng().fill(&mut peer_id[8..]);
    peer_id
}

/// Announce tiers with BEP 12 failover and promotion.
///
/// Tier order is fixed; the order within each tier is randomized once at
/// construction, and the first tracker to respond is remembered by moving
/// it to the front of its tier.
pub struct TrackerSet {
    http: reqwest::Client,
    tiers: Mutex<Vec<Vec<String>>>,
    /// Last tracker that answered; tried first on the next announce
    preferred: Mutex<Option<String>>,
    announce_timeout: Duration,
}

impl TrackerSet {
    /// Build from announce tiers; a single-tracker torrent passes one tier
    /// of one URL. Empty tiers are discarded.
    pub fn new(tiers: Vec<Vec<String>>, announce_timeout: Duration) -> Result<Self> {
        let mut rng = rand::rng();
        let tiers: Vec<Vec<String>> = tiers
            .into_iter()
            .map(|mut tier| {
                tier.retain(|u| match url::Url::parse(u) {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!("discarding malformed tracker URL {}: {}", u, e);
                        false
                    }
                });
                tier.shuffle(&mut rng);
                tier
            })
            .filter(|tier| !tier.is_empty())
            .collect();

        let http = reqwest::Client::builder()
            .timeout(announce_timeout)
            .build()
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::Tls,
                    format!("failed to build HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            http,
            tiers: Mutex::new(tiers),
            preferred: Mutex::new(None),
            announce_timeout,
        })
    }

    /// True when no trackers are configured at all.
    pub fn is_empty(&self) -> bool {
        self.tiers.lock().is_empty()
    }

    /// Announce to the first tracker that answers, trying tiers in order
    /// and trackers within a tier in their current order. The responding
    /// tracker is promoted to the front of its tier.
    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let tiers_snapshot: Vec<Vec<String>> = self.tiers.lock().clone();

        if tiers_snapshot.is_empty() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "no trackers configured",
            ));
        }

        let mut last_error = None;

        // The tracker that answered last time goes first, skipping the
        // tiers in front of it entirely while it keeps working.
        let preferred = self.preferred.lock().clone();
        if let Some(ref url) = preferred {
            match self.announce_one(url, request).await {
                Ok(response) => {
                    tracing::debug!(
                        "announced to {}: {} peers, interval {:?}",
                        url,
                        response.peers.len(),
                        response.interval
                    );
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!("announce to preferred tracker {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        for (tier_index, tier) in tiers_snapshot.iter().enumerate() {
            for url in tier {
                if preferred.as_deref() == Some(url.as_str()) {
                    continue;
                }
                match self.announce_one(url, request).await {
                    Ok(response) => {
                        tracing::debug!(
                            "announced to {}: {} peers, interval {:?}",
                            url,
                            response.peers.len(),
                            response.interval
                        );
                        self.promote(tier_index, url);
                        *self.preferred.lock() = Some(url.clone());
                        return Ok(response);
                    }
                    Err(e) => {
                        tracing::warn!("announce to {} failed: {}", url, e);
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::TrackerError, "all trackers failed")
        }))
    }

    fn promote(&self, tier_index: usize, url: &str) {
        let mut tiers = self.tiers.lock();
        if let Some(tier) = tiers.get_mut(tier_index) {
            if let Some(pos) = tier.iter().position(|u| u == url) {
                if pos > 0 {
                    let winner = tier.remove(pos);
                    tier.insert(0, winner);
                }
            }
        }
    }

    async fn announce_one(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.announce_http(url, request).await
        } else if url.starts_with("udp://") {
            self.announce_udp(url, request).await
        } else {
            Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("unsupported tracker protocol: {}", url),
            ))
        }
    }

    // HTTP (BEP 3)

    async fn announce_http(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let mut full = String::with_capacity(url.len() + 256);
        full.push_str(url);
        full.push(if url.contains('?') { '&' } else { '?' });

        full.push_str("info_hash=");
        for byte in &request.info_hash {
            full.push_str(&format!("%{:02X}", byte));
        }
        full.push_str("&peer_id=");
        for byte in &request.peer_id {
            full.push_str(&format!("%{:02X}", byte));
        }

        full.push_str(&format!("&port={}", request.port));
        full.push_str(&format!("&uploaded={}", request.uploaded));
        full.push_str(&format!("&downloaded={}", request.downloaded));
        full.push_str(&format!("&left={}", request.left));
        full.push_str("&compact=1");

        let event = request.event.http_value();
        if !event.is_empty() {
            full.push_str(&format!("&event={}", event));
        }
        full.push_str(&format!("&numwant={}", request.numwant));

        let response = self.http.get(&full).send().await?;

        if !response.status().is_success() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("tracker returned status {}", response.status()),
            ));
        }

        let body = response.bytes().await?;
        parse_http_response(&body)
    }

    // UDP (BEP 15)

    async fn announce_udp(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let host_port = url
            .strip_prefix("udp://")
            .and_then(|rest| rest.split('/').next())
            .ok_or_else(|| {
                EngineError::protocol(ProtocolErrorKind::TrackerError, "invalid UDP tracker URL")
            })?;

        let addr = tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| {
                EngineError::network(
                    NetworkErrorKind::DnsResolution,
                    format!("failed to resolve {}: {}", host_port, e),
                )
            })?
            .next()
            .ok_or_else(|| {
                EngineError::network(NetworkErrorKind::DnsResolution, "no addresses for tracker")
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await.map_err(|e| {
            EngineError::network(
                NetworkErrorKind::ConnectionRefused,
                format!("UDP connect failed: {}", e),
            )
        })?;

        let connection_id = self.udp_connect(&socket).await?;
        self.udp_announce(&socket, connection_id, request).await
    }

    /// Send a request with the BEP 15 retransmit schedule, returning the
    /// first datagram that arrives within a try's window.
    async fn udp_exchange(&self, socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>> {
        let mut response = vec![0u8; 4096];

        for attempt in 0..=UDP_MAX_RETRIES {
            socket.send(request).await.map_err(|e| {
                EngineError::network(NetworkErrorKind::Other, format!("UDP send failed: {}", e))
            })?;

            let wait = Duration::from_secs(15u64 << attempt);
            match timeout(wait, socket.recv(&mut response)).await {
                Ok(Ok(len)) => {
                    response.truncate(len);
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    return Err(EngineError::network(
                        NetworkErrorKind::Other,
                        format!("UDP recv failed: {}", e),
                    ));
                }
                Err(_) => {
                    tracing::debug!(
                        "UDP tracker try {} timed out after {:?}, retransmitting",
                        attempt,
                        wait
                    );
                }
            }
        }

        Err(EngineError::network(
            NetworkErrorKind::Timeout,
            "UDP tracker did not respond",
        ))
    }

    async fn udp_connect(&self, socket: &UdpSocket) -> Result<i64> {
        let transaction_id: i32 = rand::rng().random();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes()); // action: connect
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self.udp_exchange(socket, &request).await?;

        if response.len() < 16 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP connect response too short",
            ));
        }

        let action = i32::from_be_bytes(response[0..4].try_into().unwrap());
        let resp_transaction = i32::from_be_bytes(response[4..8].try_into().unwrap());
        let connection_id = i64::from_be_bytes(response[8..16].try_into().unwrap());

        if action != 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP connect returned action {}", action),
            ));
        }
        if resp_transaction != transaction_id {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP transaction ID mismatch",
            ));
        }

        Ok(connection_id)
    }

    async fn udp_announce(
        &self,
        socket: &UdpSocket,
        connection_id: i64,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let transaction_id: i32 = rand::rng().random();

        let mut req = Vec::with_capacity(98);
        req.extend_from_slice(&connection_id.to_be_bytes());
        req.extend_from_slice(&1u32.to_be_bytes()); // action: announce
        req.extend_from_slice(&transaction_id.to_be_bytes());
        req.extend_from_slice(&request.info_hash);
        req.extend_from_slice(&request.peer_id);
        req.extend_from_slice(&request.downloaded.to_be_bytes());
        req.extend_from_slice(&request.left.to_be_bytes());
        req.extend_from_slice(&request.uploaded.to_be_bytes());
        req.extend_from_slice(&request.event.udp_value().to_be_bytes());
        req.extend_from_slice(&0u32.to_be_bytes()); // IP: default
        req.extend_from_slice(&rand::rng().random::<u32>().to_be_bytes()); // key
        req.extend_from_slice(&request.numwant.to_be_bytes());
        req.extend_from_slice(&request.port.to_be_bytes());

        let response = self.udp_exchange(socket, &req).await?;

        if response.len() < 8 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP announce response too short",
            ));
        }

        let action = i32::from_be_bytes(response[0..4].try_into().unwrap());
        let resp_transaction = i32::from_be_bytes(response[4..8].try_into().unwrap());

        if action == 3 {
            let message = if response.len() > 8 {
                String::from_utf8_lossy(&response[8..]).to_string()
            } else {
                String::from("(no message)")
            };
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP tracker error: {}", message),
            ));
        }
        if action != 1 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP announce returned action {}", action),
            ));
        }
        if response.len() < 20 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP announce response too short",
            ));
        }
        if resp_transaction != transaction_id {
            return Err(EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP transaction ID mismatch",
            ));
        }

        let interval = u32::from_be_bytes(response[8..12].try_into().unwrap()) as u64;
        let incomplete = u32::from_be_bytes(response[12..16].try_into().unwrap());
        let complete = u32::from_be_bytes(response[16..20].try_into().unwrap());

        let peers = response[20..]
            .chunks_exact(6)
            .map(|chunk| PeerAddr {
                ip: format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]),
                port: u16::from_be_bytes([chunk[4], chunk[5]]),
                peer_id: None,
            })
            .collect();

        Ok(AnnounceResponse {
            interval: clamp_interval(interval),
            min_interval: None,
            complete: Some(complete),
            incomplete: Some(incomplete),
            peers,
        })
    }

    /// Timeout used for the best-effort stopped announce on close.
    pub fn announce_timeout(&self) -> Duration {
        self.announce_timeout
    }
}

fn clamp_interval(seconds: u64) -> Duration {
    Duration::from_secs(seconds.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL))
}

/// Parse a bencoded HTTP announce response.
fn parse_http_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value = BencodeValue::parse_exact(body).map_err(|_| {
        EngineError::protocol(
            ProtocolErrorKind::TrackerError,
            "invalid tracker response encoding",
        )
    })?;

    if value.as_dict().is_none() {
        return Err(EngineError::protocol(
            ProtocolErrorKind::TrackerError,
            "tracker response must be a dictionary",
        ));
    }

    if let Some(failure) = value.get("failure reason").and_then(|v| v.as_string()) {
        return Err(EngineError::protocol(
            ProtocolErrorKind::TrackerError,
            format!("tracker error: {}", failure),
        ));
    }

    let interval = value
        .get("interval")
        .and_then(|v| v.as_uint())
        .ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::TrackerError,
                "missing 'interval' in tracker response",
            )
        })?;

    let min_interval = value
        .get("min interval")
        .and_then(|v| v.as_uint())
        .map(clamp_interval);

    let complete = value.get("complete").and_then(|v| v.as_uint()).map(|v| v as u32);
    let incomplete = value
        .get("incomplete")
        .and_then(|v| v.as_uint())
        .map(|v| v as u32);

    let peers = parse_peers(value.get("peers"))?;

    Ok(AnnounceResponse {
        interval: clamp_interval(interval),
        min_interval,
        complete,
        incomplete,
        peers,
    })
}

/// Parse peers in either compact (6 bytes each) or dictionary form.
fn parse_peers(value: Option<&BencodeValue>) -> Result<Vec<PeerAddr>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    match value {
        BencodeValue::Bytes(data) => {
            if data.len() % 6 != 0 {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::TrackerError,
                    "invalid compact peers length",
                ));
            }

            Ok(data
                .chunks_exact(6)
                .map(|chunk| PeerAddr {
                    ip: format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]),
                    port: u16::from_be_bytes([chunk[4], chunk[5]]),
                    peer_id: None,
                })
                .collect())
        }

        BencodeValue::List(list) => {
            let mut peers = Vec::with_capacity(list.len());

            for item in list {
                let ip = item
                    .get("ip")
                    .and_then(|v| v.as_string())
                    .ok_or_else(|| {
                        EngineError::protocol(ProtocolErrorKind::TrackerError, "peer missing 'ip'")
                    })?
                    .to_string();

                let port = item.get("port").and_then(|v| v.as_uint()).ok_or_else(|| {
                    EngineError::protocol(ProtocolErrorKind::TrackerError, "peer missing 'port'")
                })? as u16;

                let peer_id = item.get("peer id").and_then(|v| v.as_bytes()).and_then(|b| {
                    <[u8; 20]>::try_from(b).ok()
                });

                peers.push(PeerAddr { ip, port, peer_id });
            }

            Ok(peers)
        }

        _ => Err(EngineError::protocol(
            ProtocolErrorKind::TrackerError,
            "invalid peers format",
        )),
    }
}
