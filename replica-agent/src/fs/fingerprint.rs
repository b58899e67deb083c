//! File fingerprints used as cheap change-detection tokens.
//!
//! A fingerprint is the pair (size, last-modified milliseconds). Two files with
//! equal fingerprints are assumed identical; a rewrite with the same size inside
//! the same millisecond goes unnoticed, which is an accepted trade-off.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (milliseconds since Unix epoch)
    pub version: u64,
}

impl FileFingerprint {
    pub const fn new(size: u64, version: u64) -> Self {
        Self { size, version }
    }

    /// Fingerprint the file at `path`
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Self::from_metadata(&metadata)
    }

    pub fn from_metadata(metadata: &fs::Metadata) -> std::io::Result<Self> {
        let version = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Ok(Self {
            size: metadata.len(),
            version,
        })
    }

    /// The modification time this fingerprint stands for
    pub fn modified_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.version)
    }

    /// Set the modification time of an open (writable) file to this fingerprint's version,
    /// so the file fingerprints identically to the one it was copied from.
    pub fn stamp(&self, file: &fs::File) -> std::io::Result<()> {
        file.set_modified(self.modified_time())
    }
}

impl fmt::Display for FileFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(size={}, version={})", self.size, self.version)
    }
}
