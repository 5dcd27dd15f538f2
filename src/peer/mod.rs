//! Peer wire protocol
//!
//! `message` holds the handshake and length-prefixed message codec (BEP 3);
//! `session` runs a connected peer as a reader/writer task pair feeding the
//! controller's event loop.

pub mod message;
pub mod session;

pub use message::{Handshake, PeerMessage, HANDSHAKE_SIZE};
pub use session::{PeerEvent, PeerEventKind, PeerSession, SessionHandle};

/// Get the client name from an Azureus-style peer ID, for logging.
pub fn peer_id_client(peer_id: &[u8; 20]) -> Option<String> {
    if peer_id[0] != b'-' || peer_id[7] != b'-' {
        return None;
    }

    let client_id = std::str::from_utf8(&peer_id[1..3]).ok()?;
    let version = std::str::from_utf8(&peer_id[3..7]).ok()?;

    let client_name = match client_id {
        "AZ" => "Azureus",
        "DE" => "Deluge",
        "LT" => "libtorrent",
        "qB" => "qBittorrent",
        "TR" => "Transmission",
        "UT" => "uTorrent",
        "TD" => "Tidal",
        _ => return Some(format!("{} {}", client_id, version)),
    };

    Some(format!("{} {}", client_name, version))
}
