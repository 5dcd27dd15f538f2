//! Resume interface and record format
//!
//! Progress persistence so a restarted engine can skip already-downloaded
//! pieces. The record is an opaque blob to the backend; the engine encodes
//! infohash, transfer totals, and the bitfield snapshot into it. Loaded
//! bits are only trusted after a re-verification pass against storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Persisted engine progress.
///
/// Binary layout: 20-byte infohash, 8-byte big-endian downloaded, 8-byte
/// big-endian uploaded, 4-byte big-endian bitfield byte length, bitfield
/// bytes (wire BITFIELD payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    /// Infohash the record belongs to
    pub info_hash: Sha1Hash,
    /// Total bytes downloaded
    pub downloaded: u64,
    /// Total bytes uploaded
    pub uploaded: u64,
    /// Bitfield snapshot (wire format)
    pub bitfield: Vec<u8>,
}

impl ResumeRecord {
    /// Serialize to the persisted byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + 8 + 8 + 4 + self.bitfield.len());
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.downloaded.to_be_bytes());
        buf.extend_from_slice(&self.uploaded.to_be_bytes());
        buf.extend_from_slice(&(self.bitfield.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.bitfield);
        buf
    }

    /// Parse the persisted byte form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        const HEADER: usize = 20 + 8 + 8 + 4;
        if data.len() < HEADER {
            return Err(EngineError::protocol(
                ProtocolErrorKind::ResumeError,
                format!("resume record too short: {} bytes", data.len()),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[..20]);
        let downloaded = u64::from_be_bytes(data[20..28].try_into().unwrap());
        let uploaded = u64::from_be_bytes(data[28..36].try_into().unwrap());
        let bitfield_len = u32::from_be_bytes(data[36..40].try_into().unwrap()) as usize;

        if data.len() != HEADER + bitfield_len {
            return Err(EngineError::protocol(
                ProtocolErrorKind::ResumeError,
                format!(
                    "resume record length mismatch: {} bytes, bitfield claims {}",
                    data.len(),
                    bitfield_len
                ),
            ));
        }

        Ok(Self {
            info_hash,
            downloaded,
            uploaded,
            bitfield: data[HEADER..].to_vec(),
        })
    }
}

/// Backend persisting the resume record.
#[async_trait]
pub trait Resume: Send + Sync {
    /// Load the previously saved record, if any.
    async fn load(&self) -> Result<Option<ResumeRecord>>;

    /// Persist the record, replacing any previous one.
    async fn save(&self, record: &ResumeRecord) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

/// Sanitize a torrent name for use in a resume filename.
///
/// Path separators and control characters become `_`; an empty result
/// falls back to `fallback` (typically the infohash hex).
pub fn sanitize_name(name: &str, fallback: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    if cleaned.trim_matches(['_', '.', ' ']).is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

/// Build the conventional resume filename `<name>.<infohash-hex>.resume`.
pub fn resume_file_name(name: &str, info_hash: &Sha1Hash) -> String {
    let hex: String = info_hash.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}.{}.resume", sanitize_name(name, &hex), hex)
}

/// File-backed resume storage with atomic replacement.
pub struct FileResume {
    path: PathBuf,
}

impl FileResume {
    /// Use the given file path for the record.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Use the conventional filename under `dir`.
    pub fn in_dir(dir: &Path, name: &str, info_hash: &Sha1Hash) -> Self {
        Self {
            path: dir.join(resume_file_name(name, info_hash)),
        }
    }

    /// Path of the record file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Resume for FileResume {
    async fn load(&self) -> Result<Option<ResumeRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => ResumeRecord::decode(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, record: &ResumeRecord) -> Result<()> {
        // Write-then-rename so a crash never leaves a torn record.
        let tmp = self.path.with_extension("resume.tmp");
        tokio::fs::write(&tmp, record.encode()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory resume storage, used by the test suite.
#[derive(Default)]
pub struct MemoryResume {
    record: Mutex<Option<ResumeRecord>>,
}

impl MemoryResume {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Resume for MemoryResume {
    async fn load(&self) -> Result<Option<ResumeRecord>> {
        Ok(self.record.lock().clone())
    }

    async fn save(&self, record: &ResumeRecord) -> Result<()> {
        *self.record.lock() = Some(record.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ResumeRecord {
        ResumeRecord {
            info_hash: [0xAB; 20],
            downloaded: 123_456_789,
            uploaded: 42,
            bitfield: vec![0b1010_0000, 0b0100_0000],
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample_record();
        let decoded = ResumeRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_rejects_truncation() {
        let encoded = sample_record().encode();
        assert!(ResumeRecord::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(ResumeRecord::decode(&encoded[..10]).is_err());

        // Extra bytes beyond the declared bitfield length
        let mut padded = encoded;
        padded.push(0);
        assert!(ResumeRecord::decode(&padded).is_err());
    }

    #[test]
    fn test_empty_bitfield_record() {
        let record = ResumeRecord {
            info_hash: [1; 20],
            downloaded: 0,
            uploaded: 0,
            bitfield: vec![],
        };
        assert_eq!(ResumeRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("plain", "fb"), "plain");
        assert_eq!(sanitize_name("a/b\\c", "fb"), "a_b_c");
        assert_eq!(sanitize_name("tab\there", "fb"), "tab_here");
        assert_eq!(sanitize_name("", "fb"), "fb");
        assert_eq!(sanitize_name("///", "fb"), "fb");
    }

    #[test]
    fn test_resume_file_name() {
        let name = resume_file_name("my torrent", &[0x01; 20]);
        assert!(name.starts_with("my torrent."));
        assert!(name.ends_with(".resume"));
        assert!(name.contains("0101010101"));
    }

    #[tokio::test]
    async fn test_file_resume_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let resume = FileResume::in_dir(dir.path(), "test", &[0x02; 20]);

        assert!(resume.load().await.unwrap().is_none());

        let record = sample_record();
        resume.save(&record).await.unwrap();
        assert_eq!(resume.load().await.unwrap(), Some(record.clone()));

        // Overwrite is atomic and replaces the old record
        let mut newer = record;
        newer.downloaded += 1;
        resume.save(&newer).await.unwrap();
        assert_eq!(resume.load().await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_memory_resume() {
        let resume = MemoryResume::new();
        assert!(resume.load().await.unwrap().is_none());
        let record = sample_record();
        resume.save(&record).await.unwrap();
        assert_eq!(resume.load().await.unwrap(), Some(record));
    }
}
