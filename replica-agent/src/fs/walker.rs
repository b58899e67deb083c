//! Directory listing for replication catalogs.
//!
//! Sources are flat directories: only regular files directly below the root
//! are reported, never the root itself or subdirectories.

use crate::fs::fingerprint::FileFingerprint;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth below the root (1 = direct children only)
    pub max_depth: usize,

    /// Exclude patterns (substring match on the file name)
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: 1,
            exclude_patterns: vec!["write.lock".to_string(), ".tmp".to_string()],
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path relative to the root, `/`-separated
    pub name: String,

    /// Size and modification version at scan time
    pub fingerprint: FileFingerprint,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path();
        let name = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            fingerprint: FileFingerprint::from_metadata(&metadata)?,
            name,
        })
    }
}

/// Walk a directory and fingerprint every regular file that is not excluded.
///
/// A missing root yields an empty list. Any error reading an entry's metadata
/// is returned, since a wrong fingerprint is worse than a failed scan.
///
/// # Example
/// ```no_run
/// use replica_agent::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let options = WalkOptions::default();
/// let files = walk_directory(Path::new("/var/lib/index/data"), &options).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .max_depth(options.max_depth);

    let mut files = Vec::new();

    for entry in walker {
        let entry = entry?;

        if !entry.file_type().is_file() {
            continue;
        }

        if should_exclude(&entry, &options.exclude_patterns) {
            continue;
        }

        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
