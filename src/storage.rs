//! Storage interface
//!
//! The engine does not touch the filesystem itself; it issues
//! block-aligned, piece-addressed reads and writes against this trait and
//! leaves the translation into file offsets to the backend (see
//! `Info::files_for_piece` for the mapping file-backed implementations
//! need).

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{EngineError, Result, StorageErrorKind};

/// Backend holding the torrent's payload bytes.
///
/// Implementations must support concurrent reads; the engine serializes
/// writes per piece but may write different pieces concurrently. No
/// cross-file atomicity is assumed.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read `len` bytes at `offset` within piece `piece_index`.
    async fn read(&self, piece_index: u32, offset: u32, len: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset` within piece `piece_index`.
    async fn write(&self, piece_index: u32, offset: u32, data: &[u8]) -> Result<()>;

    /// Flush buffered writes to durable storage.
    async fn flush(&self) -> Result<()>;

    /// Release backend resources. Reads and writes after `close` may fail.
    async fn close(&self) -> Result<()>;
}

/// In-memory piece-addressed storage, used by the test suite.
pub struct MemoryStorage {
    pieces: RwLock<Vec<Vec<u8>>>,
    closed: RwLock<bool>,
}

impl MemoryStorage {
    /// Allocate zeroed storage for the given piece geometry.
    pub fn new(piece_length: u64, total_size: u64) -> Self {
        let num_pieces = total_size.div_ceil(piece_length) as usize;
        let pieces = (0..num_pieces)
            .map(|i| {
                let start = i as u64 * piece_length;
                let len = piece_length.min(total_size - start) as usize;
                vec![0u8; len]
            })
            .collect();

        Self {
            pieces: RwLock::new(pieces),
            closed: RwLock::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if *self.closed.read() {
            Err(EngineError::storage(
                StorageErrorKind::Io,
                "storage is closed",
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, piece_index: u32, offset: u32, len: u32) -> Result<Vec<u8>> {
        self.check_open()?;
        let pieces = self.pieces.read();
        let piece = pieces.get(piece_index as usize).ok_or_else(|| {
            EngineError::storage(
                StorageErrorKind::OutOfBounds,
                format!("piece {} out of range", piece_index),
            )
        })?;

        let start = offset as usize;
        let end = start + len as usize;
        if end > piece.len() {
            return Err(EngineError::storage(
                StorageErrorKind::OutOfBounds,
                format!(
                    "read [{start}, {end}) past piece {} length {}",
                    piece_index,
                    piece.len()
                ),
            ));
        }

        Ok(piece[start..end].to_vec())
    }

    async fn write(&self, piece_index: u32, offset: u32, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut pieces = self.pieces.write();
        let piece = pieces.get_mut(piece_index as usize).ok_or_else(|| {
            EngineError::storage(
                StorageErrorKind::OutOfBounds,
                format!("piece {} out of range", piece_index),
            )
        })?;

        let start = offset as usize;
        let end = start + data.len();
        if end > piece.len() {
            return Err(EngineError::storage(
                StorageErrorKind::OutOfBounds,
                format!(
                    "write [{start}, {end}) past piece {} length {}",
                    piece_index,
                    piece.len()
                ),
            ));
        }

        piece[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.check_open()
    }

    async fn close(&self) -> Result<()> {
        *self.closed.write() = true;
        Ok(())
    }
}
