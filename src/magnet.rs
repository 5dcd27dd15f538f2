//! Magnet URI parsing
//!
//! Format: `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>`
//!
//! The engine core cannot fetch the info dictionary itself (metadata
//! exchange is a front-end concern), but a magnet still carries enough to
//! construct the engine: the infohash, a display name, and tracker URLs.

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Parsed magnet URI
#[derive(Debug, Clone)]
pub struct MagnetUri {
    /// Info hash (20 bytes)
    pub info_hash: Sha1Hash,
    /// Display name (optional)
    pub display_name: Option<String>,
    /// Tracker URLs, in announce order
    pub trackers: Vec<String>,
}

impl MagnetUri {
    /// Parse a magnet URI string.
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri.strip_prefix("magnet:?").ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidMagnet,
                "URI must start with 'magnet:?'",
            )
        })?;

        let mut info_hash: Option<Sha1Hash> = None;
        let mut display_name: Option<String> = None;
        let mut trackers = Vec::new();

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = url_decode(value);

            match key {
                "xt" => {
                    if let Some(hash) = parse_btih(&value) {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if !value.is_empty() {
                        trackers.push(value);
                    }
                }
                // Unknown parameters (xl, ws, xs, ...) are ignored.
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidMagnet,
                "missing or invalid 'xt' parameter (info hash)",
            )
        })?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }

    /// Get the info_hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Display name, falling back to the infohash hex
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash_hex())
    }
}

/// Parse a BitTorrent info hash from an xt parameter.
///
/// Supports both hex (40 chars) and base32 (32 chars) forms.
fn parse_btih(xt: &str) -> Option<Sha1Hash> {
    let hash_str = xt.strip_prefix("urn:btih:")?;

    match hash_str.len() {
        40 => {
            let bytes: Vec<u8> = (0..40)
                .step_by(2)
                .filter_map(|i| u8::from_str_radix(&hash_str[i..i + 2], 16).ok())
                .collect();

            if bytes.len() == 20 {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&bytes);
                Some(hash)
            } else {
                None
            }
        }
        32 => base32_decode(hash_str),
        _ => None,
    }
}

/// Decode RFC 4648 base32 (no padding) into a 20-byte hash.
fn base32_decode(s: &str) -> Option<Sha1Hash> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(20);

    for c in s.bytes() {
        let value = ALPHABET.iter().position(|&a| a == c.to_ascii_uppercase())? as u64;
        bits = (bits << 5) | value;
        bit_count += 5;

        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }

    if out.len() == 20 {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&out);
        Some(hash)
    } else {
        None
    }
}

/// Minimal percent-decoding for magnet query values.
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                Ok(b) => {
                    out.push(b);
                    i += 3;
                }
                Err(_) => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
