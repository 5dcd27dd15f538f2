//! Owned-piece bitfield
//!
//! A set over `[0, num_pieces)` whose serialized form is exactly the wire
//! BITFIELD payload: high bit first within each byte, trailing bits of the
//! last byte zero. The engine maintains the invariant that a bit is set if
//! and only if the piece has been written to storage and hash-verified.

use bitvec::prelude::*;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Compact set of owned piece indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// Create an empty bitfield for `num_pieces` pieces.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 0; num_pieces],
        }
    }

    /// Parse a wire-format BITFIELD payload.
    ///
    /// The payload must be exactly `ceil(num_pieces / 8)` bytes and any
    /// bits at or beyond `num_pieces` must be zero; violations are
    /// protocol errors that close the offending session.
    pub fn from_snapshot(payload: &[u8], num_pieces: usize) -> Result<Self> {
        let expected_len = num_pieces.div_ceil(8);
        if payload.len() != expected_len {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!(
                    "bitfield length {} does not match {} pieces (expected {} bytes)",
                    payload.len(),
                    num_pieces,
                    expected_len
                ),
            ));
        }

        let mut bits: BitVec<u8, Msb0> = BitVec::from_slice(payload);
        if bits[num_pieces..].any() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "bitfield has nonzero trailing bits",
            ));
        }
        bits.truncate(num_pieces);

        Ok(Self { bits })
    }

    /// Serialize to the wire BITFIELD payload.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut padded = self.bits.clone();
        padded.resize(self.bits.len().div_ceil(8) * 8, false);
        padded.into_vec()
    }

    /// Mark piece `index` as owned.
    ///
    /// Out-of-range indices are ignored; the decoder validates indices at
    /// the boundary so this is never reachable with one.
    pub fn set(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, true);
        }
    }

    /// Clear piece `index`.
    pub fn clear(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, false);
        }
    }

    /// Check whether piece `index` is owned.
    pub fn test(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Number of owned pieces.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Total number of pieces.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True for a zero-piece bitfield.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// True once every piece is owned.
    pub fn is_full(&self) -> bool {
        !self.bits.is_empty() && self.bits.all()
    }

    /// Iterate over owned piece indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_test_count() {
        let mut bf = Bitfield::new(10);
        assert_eq!(bf.count(), 0);
        assert!(!bf.test(3));

        bf.set(3);
        bf.set(9);
        assert!(bf.test(3));
        assert!(bf.test(9));
        assert_eq!(bf.count(), 2);
        assert!(!bf.is_full());

        bf.clear(3);
        assert!(!bf.test(3));
        assert_eq!(bf.count(), 1);
    }

    #[test]
    fn test_snapshot_wire_order() {
        let mut bf = Bitfield::new(10);
        bf.set(0);
        bf.set(2);
        bf.set(9);
        // High bit first: piece 0 -> 0x80, piece 2 -> 0x20, piece 9 -> bit 6
        // of the second byte.
        assert_eq!(bf.snapshot(), vec![0b1010_0000, 0b0100_0000]);
    }

    #[test]
    fn test_snapshot_roundtrip_all_widths() {
        for n in 1..=33 {
            let mut bf = Bitfield::new(n);
            for i in (0..n).step_by(3) {
                bf.set(i);
            }
            let restored = Bitfield::from_snapshot(&bf.snapshot(), n).unwrap();
            assert_eq!(restored, bf, "roundtrip failed for {} pieces", n);
        }
    }

    #[test]
    fn test_from_snapshot_rejects_wrong_length() {
        assert!(Bitfield::from_snapshot(&[0x00], 10).is_err());
        assert!(Bitfield::from_snapshot(&[0x00; 3], 10).is_err());
        assert!(Bitfield::from_snapshot(&[0x00; 2], 10).is_ok());
    }

    #[test]
    fn test_from_snapshot_rejects_trailing_garbage() {
        // 10 pieces -> 2 bytes, bits 10..16 must be zero. Bit 15 set:
        assert!(Bitfield::from_snapshot(&[0x00, 0x01], 10).is_err());
        // Bit 10 set:
        assert!(Bitfield::from_snapshot(&[0x00, 0b0010_0000], 10).is_err());
        // Bit 9 set is legal:
        let bf = Bitfield::from_snapshot(&[0x00, 0b0100_0000], 10).unwrap();
        assert!(bf.test(9));
    }

    #[test]
    fn test_is_full() {
        let mut bf = Bitfield::new(3);
        bf.set(0);
        bf.set(1);
        assert!(!bf.is_full());
        bf.set(2);
        assert!(bf.is_full());
    }

    #[test]
    fn test_iter_set() {
        let mut bf = Bitfield::new(8);
        bf.set(1);
        bf.set(5);
        bf.set(6);
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![1, 5, 6]);
    }
}
