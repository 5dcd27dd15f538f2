//! Bencode parser and encoder
//!
//! Used for tracker announce responses. Hand-rolled rather than pulled
//! from serde because tracker dictionaries mix UTF-8 text with raw binary
//! (compact peer strings) and we want strict, allocation-bounded parsing
//! of untrusted input.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Maximum allowed length for a bencode string (16 MiB).
/// Tracker responses are small; anything near this is hostile.
const MAX_STRING_LENGTH: usize = 16 * 1024 * 1024;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer value (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte string keys (sorted by key)
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 40 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).to_string(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

fn parse_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::BencodeParse, message)
}

impl BencodeValue {
    /// Parse one bencode value, returning it with the unparsed remainder.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        match data.first() {
            None => Err(parse_error("empty input")),
            Some(b'i') => Self::parse_integer(data),
            Some(b'l') => Self::parse_list(data),
            Some(b'd') => Self::parse_dict(data),
            Some(b'0'..=b'9') => Self::parse_bytes(data),
            Some(c) => Err(parse_error(format!(
                "invalid bencode type marker: {:?}",
                *c as char
            ))),
        }
    }

    /// Parse a complete bencode value, rejecting trailing data.
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let (value, remaining) = Self::parse(data)?;
        if !remaining.is_empty() {
            return Err(parse_error(format!(
                "trailing data: {} bytes",
                remaining.len()
            )));
        }
        Ok(value)
    }

    fn parse_integer(data: &[u8]) -> Result<(Self, &[u8])> {
        let end = data[1..]
            .iter()
            .position(|&c| c == b'e')
            .ok_or_else(|| parse_error("unterminated integer"))?
            + 1;

        let num_str = std::str::from_utf8(&data[1..end])
            .map_err(|_| parse_error("invalid integer encoding"))?;

        // Canonical form only: no leading zeros, no negative zero.
        if (num_str.len() > 1 && num_str.starts_with('0'))
            || num_str == "-0"
            || (num_str.starts_with("-0") && num_str.len() > 2)
        {
            return Err(parse_error(format!("non-canonical integer: {num_str}")));
        }

        let value = num_str
            .parse::<i64>()
            .map_err(|_| parse_error("integer out of range"))?;

        Ok((Self::Integer(value), &data[end + 1..]))
    }

    fn parse_bytes(data: &[u8]) -> Result<(Self, &[u8])> {
        let colon = data
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| parse_error("expected colon in string"))?;

        let len = std::str::from_utf8(&data[..colon])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| parse_error("invalid string length"))?;

        if len > MAX_STRING_LENGTH {
            return Err(parse_error(format!("string length {len} exceeds cap")));
        }

        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| parse_error("string length exceeds available data"))?;

        Ok((Self::Bytes(data[start..end].to_vec()), &data[end..]))
    }

    fn parse_list(data: &[u8]) -> Result<(Self, &[u8])> {
        let mut items = Vec::new();
        let mut remaining = &data[1..];

        while !remaining.is_empty() && remaining[0] != b'e' {
            let (value, rest) = Self::parse(remaining)?;
            items.push(value);
            remaining = rest;
        }

        if remaining.is_empty() {
            return Err(parse_error("unterminated list"));
        }

        Ok((Self::List(items), &remaining[1..]))
    }

    fn parse_dict(data: &[u8]) -> Result<(Self, &[u8])> {
        let mut items = BTreeMap::new();
        let mut remaining = &data[1..];
        let mut last_key: Option<Vec<u8>> = None;

        while !remaining.is_empty() && remaining[0] != b'e' {
            let (key_value, rest) = Self::parse_bytes(remaining)?;
            let key = match key_value {
                Self::Bytes(k) => k,
                _ => unreachable!("parse_bytes only yields Bytes"),
            };

            // Keys must be unique and in sorted order.
            if let Some(ref lk) = last_key {
                if &key <= lk {
                    return Err(parse_error("dict keys not in sorted order"));
                }
            }
            last_key = Some(key.clone());

            let (value, rest) = Self::parse(rest)?;
            items.insert(key, value);
            remaining = rest;
        }

        if remaining.is_empty() {
            return Err(parse_error("unterminated dict"));
        }

        Ok((Self::Dict(items), &remaining[1..]))
    }

    /// Encode to bencode bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    buf.extend_from_slice(k.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(k);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    // Accessors

    /// Get as string (UTF-8)
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get dict value by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}
