//! Piece store
//!
//! Reads and writes piece bytes through the `Storage` backend and verifies
//! completed pieces against the metainfo hash table. Verification always
//! re-reads the bytes from storage: no HAVE is ever broadcast for data the
//! backend cannot return.

use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::metainfo::Info;
use crate::storage::Storage;

/// Transfer block size (16 KiB). The last block of a piece may be shorter.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Piece-level view over the storage backend.
#[derive(Clone)]
pub struct PieceStore {
    info: Arc<Info>,
    storage: Arc<dyn Storage>,
}

impl PieceStore {
    pub fn new(info: Arc<Info>, storage: Arc<dyn Storage>) -> Self {
        Self { info, storage }
    }

    /// The metainfo this store serves.
    pub fn info(&self) -> &Arc<Info> {
        &self.info
    }

    /// Length of piece `index`, if it exists.
    pub fn piece_len(&self, index: u32) -> Option<u64> {
        self.info.piece_len(index as usize)
    }

    /// Number of blocks in piece `index` (0 for out-of-range pieces).
    pub fn block_count(&self, index: u32) -> u32 {
        self.piece_len(index)
            .map(|len| len.div_ceil(BLOCK_SIZE as u64) as u32)
            .unwrap_or(0)
    }

    /// Offset and length of block `block` within piece `index`.
    pub fn block_range(&self, index: u32, block: u32) -> Option<(u32, u32)> {
        let piece_len = self.piece_len(index)?;
        let offset = block as u64 * BLOCK_SIZE as u64;
        if offset >= piece_len {
            return None;
        }
        let len = (piece_len - offset).min(BLOCK_SIZE as u64) as u32;
        Some((offset as u32, len))
    }

    /// Validate a peer-supplied `(piece, offset, length)` triple.
    ///
    /// Requests past the torrent length or larger than a block are
    /// protocol errors that close the session.
    pub fn validate_request(&self, index: u32, offset: u32, length: u32) -> Result<()> {
        let piece_len = self.piece_len(index).ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("piece index {} out of range", index),
            )
        })?;

        if length == 0 || length > BLOCK_SIZE {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("block length {} outside (0, {}]", length, BLOCK_SIZE),
            ));
        }

        let end = offset as u64 + length as u64;
        if end > piece_len {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!(
                    "block [{}, {}) past piece {} length {}",
                    offset, end, index, piece_len
                ),
            ));
        }

        Ok(())
    }

    /// Write one received block into storage.
    pub async fn write_block(&self, index: u32, offset: u32, data: &[u8]) -> Result<()> {
        self.validate_request(index, offset, data.len() as u32)?;
        self.storage.write(index, offset, data).await
    }

    /// Read one block from storage, for upload to a peer.
    pub async fn read_block(&self, index: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        self.validate_request(index, offset, length)?;
        self.storage.read(index, offset, length).await
    }

    /// Re-read piece `index` from storage and check it against the hash
    /// table. Returns `Ok(true)` on a match.
    pub async fn verify(&self, index: u32) -> Result<bool> {
        let piece_len = self.piece_len(index).ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                format!("piece index {} out of range", index),
            )
        })?;
        let expected = self.info.piece_hash(index as usize).ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                format!("no hash for piece {}", index),
            )
        })?;

        let mut hasher = Sha1::new();
        let mut offset = 0u64;
        while offset < piece_len {
            let len = (piece_len - offset).min(BLOCK_SIZE as u64) as u32;
            let chunk = self.storage.read(index, offset as u32, len).await?;
            hasher.update(&chunk);
            offset += len as u64;
        }

        let actual: [u8; 20] = hasher.finalize().into();
        Ok(actual == *expected)
    }

    /// Flush the backend.
    pub async fn flush(&self) -> Result<()> {
        self.storage.flush().await
    }

    /// Close the backend.
    pub async fn close(&self) -> Result<()> {
        self.storage.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::storage::MemoryStorage;

    fn build_store(piece_length: u64, total: u64) -> (PieceStore, Vec<Vec<u8>>) {
        let num_pieces = total.div_ceil(piece_length) as usize;
        let mut piece_data = Vec::with_capacity(num_pieces);
        let mut hashes = Vec::with_capacity(num_pieces);
        for i in 0..num_pieces {
            let start = i as u64 * piece_length;
            let len = piece_length.min(total - start) as usize;
            let data: Vec<u8> = (0..len).map(|j| ((i * 31 + j) % 256) as u8).collect();
            let mut hasher = Sha1::new();
            hasher.update(&data);
            hashes.push(hasher.finalize().into());
            piece_data.push(data);
        }

        let info = Info::new(
            [9u8; 20],
            "store-test",
            piece_length,
            hashes,
            vec![(PathBuf::from("store-test"), total)],
            false,
        )
        .unwrap();

        let storage = Arc::new(MemoryStorage::new(piece_length, total));
        (PieceStore::new(Arc::new(info), storage), piece_data)
    }

    #[test]
    fn test_block_geometry() {
        // 40 KiB in 16 KiB pieces: 2 full pieces + one 8 KiB piece.
        let (store, _) = build_store(16 * 1024, 40 * 1024);
        assert_eq!(store.block_count(0), 1);
        assert_eq!(store.block_count(2), 1);
        assert_eq!(store.block_range(0, 0), Some((0, 16 * 1024)));
        assert_eq!(store.block_range(2, 0), Some((0, 8 * 1024)));
        assert_eq!(store.block_range(2, 1), None);
        assert_eq!(store.block_count(3), 0);

        // 20000-byte single piece has a short trailing block.
        let (store, _) = build_store(20_000, 20_000);
        assert_eq!(store.block_count(0), 2);
        assert_eq!(store.block_range(0, 1), Some((16_384, 3_616)));
    }

    #[test]
    fn test_validate_request_bounds() {
        let (store, _) = build_store(16 * 1024, 40 * 1024);
        assert!(store.validate_request(0, 0, 16 * 1024).is_ok());
        // Past the short last piece
        assert!(store.validate_request(2, 0, 16 * 1024).is_err());
        assert!(store.validate_request(2, 8 * 1024, 1).is_err());
        // Oversized and empty blocks
        assert!(store.validate_request(0, 0, BLOCK_SIZE + 1).is_err());
        assert!(store.validate_request(0, 0, 0).is_err());
        // Unknown piece
        assert!(store.validate_request(3, 0, 1).is_err());
    }

    #[tokio::test]
    async fn test_write_verify_read() {
        let (store, piece_data) = build_store(16 * 1024, 40 * 1024);

        // Nothing written yet: verification fails but is not an error.
        assert!(!store.verify(0).await.unwrap());

        for (i, data) in piece_data.iter().enumerate() {
            store.write_block(i as u32, 0, data).await.unwrap();
            assert!(store.verify(i as u32).await.unwrap());
        }

        let block = store.read_block(2, 0, 8 * 1024).await.unwrap();
        assert_eq!(block, piece_data[2]);
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let (store, piece_data) = build_store(16 * 1024, 16 * 1024);
        let mut corrupted = piece_data[0].clone();
        corrupted[100] ^= 0x01;
        store.write_block(0, 0, &corrupted).await.unwrap();
        assert!(!store.verify(0).await.unwrap());
    }
}
