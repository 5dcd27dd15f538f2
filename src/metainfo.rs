//! Torrent metadata types
//!
//! The engine consumes an already-parsed `Info` structure; turning a
//! .torrent file or a metadata-exchange payload into one is the embedding
//! front-end's job. This module holds that structure plus the piece and
//! file geometry every other component leans on.

use std::path::PathBuf;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// The parsed info dictionary of a torrent.
#[derive(Debug, Clone)]
pub struct Info {
    /// SHA-1 hash of the bencoded info dictionary
    pub info_hash: Sha1Hash,
    /// Suggested name for the file or directory
    pub name: String,
    /// Number of bytes per piece
    pub piece_length: u64,
    /// SHA-1 hash of each piece
    pub pieces: Vec<Sha1Hash>,
    /// Files in this torrent, offsets assigned by prefix sum
    pub files: Vec<FileInfo>,
    /// Total size of all files
    pub total_size: u64,
    /// Private flag (BEP 27)
    pub private: bool,
}

/// Information about a single file in the torrent
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path relative to the torrent root
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Byte offset in the concatenated file stream
    pub offset: u64,
}

impl Info {
    /// Build and validate an `Info` from its parsed fields.
    ///
    /// File offsets are assigned here from the running prefix sum; any
    /// offsets already present on the inputs are ignored. Fails if the
    /// piece table does not cover the file lengths exactly.
    pub fn new(
        info_hash: Sha1Hash,
        name: impl Into<String>,
        piece_length: u64,
        pieces: Vec<Sha1Hash>,
        files: Vec<(PathBuf, u64)>,
        private: bool,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                "piece length must be greater than zero",
            ));
        }
        if files.is_empty() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                "torrent must contain at least one file",
            ));
        }

        let mut offset = 0u64;
        let files: Vec<FileInfo> = files
            .into_iter()
            .map(|(path, length)| {
                let file = FileInfo {
                    path,
                    length,
                    offset,
                };
                offset += length;
                file
            })
            .collect();
        let total_size = offset;

        let expected_pieces = total_size.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidInfo,
                format!(
                    "piece count mismatch: have {}, expected {} for {} bytes with {} byte pieces",
                    pieces.len(),
                    expected_pieces,
                    total_size,
                    piece_length
                ),
            ));
        }

        Ok(Self {
            info_hash,
            name: name.into(),
            piece_length,
            pieces,
            files,
            total_size,
            private,
        })
    }

    /// Get the total number of pieces
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Get the info_hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Get the piece hash for a given piece index
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.pieces.get(index)
    }

    /// Get the byte range `[start, end)` covered by a piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = index as u64 * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.total_size);

        Some((start, end))
    }

    /// Get the length of a piece (last piece may be shorter)
    pub fn piece_len(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Get files that overlap with a given piece.
    ///
    /// Returns `(file_index, offset_within_file, length)` tuples in stream
    /// order. File-backed `Storage` implementations use this to translate
    /// piece-addressed reads and writes into per-file I/O.
    pub fn files_for_piece(&self, piece_index: usize) -> Vec<(usize, u64, u64)> {
        let Some((piece_start, piece_end)) = self.piece_range(piece_index) else {
            return Vec::new();
        };

        let mut result = Vec::new();

        for (file_idx, file) in self.files.iter().enumerate() {
            let file_start = file.offset;
            let file_end = file.offset + file.length;

            if file_start >= piece_end || file_end <= piece_start {
                continue;
            }

            let overlap_start = std::cmp::max(piece_start, file_start);
            let overlap_end = std::cmp::min(piece_end, file_end);

            result.push((
                file_idx,
                overlap_start - file_start,
                overlap_end - overlap_start,
            ));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_file_info() -> Info {
        // 40 KiB total: 16 KiB pieces, last piece 8 KiB.
        // File A is 20 KiB, file B is 20 KiB, so piece 1 spans both.
        Info::new(
            [7u8; 20],
            "two-files",
            16 * 1024,
            vec![[0u8; 20]; 3],
            vec![
                (PathBuf::from("a.bin"), 20 * 1024),
                (PathBuf::from("b.bin"), 20 * 1024),
            ],
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_piece_geometry() {
        let info = two_file_info();
        assert_eq!(info.num_pieces(), 3);
        assert_eq!(info.total_size, 40 * 1024);
        assert_eq!(info.piece_len(0), Some(16 * 1024));
        assert_eq!(info.piece_len(2), Some(8 * 1024));
        assert_eq!(info.piece_range(2), Some((32 * 1024, 40 * 1024)));
        assert_eq!(info.piece_len(3), None);
    }

    #[test]
    fn test_files_for_piece_spanning() {
        let info = two_file_info();

        // Piece 0 fits entirely in file A.
        assert_eq!(info.files_for_piece(0), vec![(0, 0, 16 * 1024)]);

        // Piece 1 covers the last 4 KiB of file A and the first 12 KiB of B.
        assert_eq!(
            info.files_for_piece(1),
            vec![(0, 16 * 1024, 4 * 1024), (1, 0, 12 * 1024)]
        );

        // Piece 2 is the 8 KiB tail of file B.
        assert_eq!(info.files_for_piece(2), vec![(1, 12 * 1024, 8 * 1024)]);

        assert!(info.files_for_piece(3).is_empty());
    }

    #[test]
    fn test_prefix_sum_offsets() {
        let info = two_file_info();
        assert_eq!(info.files[0].offset, 0);
        assert_eq!(info.files[1].offset, 20 * 1024);
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        let result = Info::new(
            [0u8; 20],
            "bad",
            16 * 1024,
            vec![[0u8; 20]; 2], // needs 3
            vec![(PathBuf::from("a"), 40 * 1024)],
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_piece_length() {
        let result = Info::new(
            [0u8; 20],
            "bad",
            0,
            vec![],
            vec![(PathBuf::from("a"), 1)],
            false,
        );
        assert!(result.is_err());
    }
}
