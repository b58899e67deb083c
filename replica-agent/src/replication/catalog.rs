//! Per-source file catalogs.
//!
//! A catalog is a read-only snapshot `name -> FileFingerprint` of one source
//! directory. Files touched by a concurrent writer during the scan may be one
//! version stale; the next round picks them up.

use crate::fs::fingerprint::FileFingerprint;
use crate::fs::walker::walk_directory;
use crate::replication::layout::{CatalogFilter, IndexLayout};
use crate::replication::source::Source;
use crate::Result;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationCatalog {
    source: Source,
    entries: BTreeMap<String, FileFingerprint>,
}

impl ReplicationCatalog {
    /// Scan `dir` for the files selected by `filter`.
    ///
    /// A missing directory gives an empty catalog ("no taxonomy" is a valid
    /// configuration). Metadata read failures are returned as errors.
    pub fn scan(source: Source, dir: &Path, filter: &CatalogFilter) -> Result<Self> {
        let mut entries = BTreeMap::new();

        match filter {
            CatalogFilter::Directory(options) => {
                for file in walk_directory(dir, options)? {
                    entries.insert(file.name, file.fingerprint);
                }
            }
            CatalogFilter::Named(names) => {
                for name in names {
                    match std::fs::metadata(dir.join(name)) {
                        Ok(metadata) if metadata.is_file() => {
                            let fingerprint = FileFingerprint::from_metadata(&metadata)?;
                            entries.insert(name.clone(), fingerprint);
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Ok(Self { source, entries })
    }

    /// Scan the live directory of `source` in `layout`
    pub fn for_layout(layout: &IndexLayout, source: Source) -> Result<Self> {
        Self::scan(source, layout.source_dir(source), &layout.catalog_filter(source))
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn entries(&self) -> &BTreeMap<String, FileFingerprint> {
        &self.entries
    }

    pub fn into_entries(self) -> BTreeMap<String, FileFingerprint> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_directory_source() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = IndexLayout::new(temp_dir.path());
        fs::create_dir_all(&layout.index_dir)?;
        fs::write(layout.index_dir.join("_0.cfs"), vec![0u8; 100])?;
        fs::write(layout.index_dir.join("segments_1"), vec![0u8; 250])?;
        fs::write(layout.index_dir.join("write.lock"), b"")?;

        let catalog = ReplicationCatalog::for_layout(&layout, Source::Index)?;

        assert_eq!(catalog.source(), Source::Index);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.entries()["_0.cfs"].size, 100);
        assert_eq!(catalog.entries()["segments_1"].size, 250);
        assert!(!catalog.entries().contains_key("write.lock"));

        Ok(())
    }

    #[test]
    fn test_missing_source_directory_is_empty() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = IndexLayout::new(temp_dir.path());

        let catalog = ReplicationCatalog::for_layout(&layout, Source::Taxonomy)?;
        assert!(catalog.is_empty());

        Ok(())
    }

    #[test]
    fn test_named_source_only_lists_present_files() -> crate::Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = IndexLayout::new(temp_dir.path());
        fs::write(temp_dir.path().join("fields.json"), b"{}")?;
        fs::write(temp_dir.path().join("unrelated.txt"), b"not metadata")?;

        let catalog = ReplicationCatalog::for_layout(&layout, Source::Metadata)?;

        assert_eq!(catalog.len(), 1);
        assert!(catalog.entries().contains_key("fields.json"));

        Ok(())
    }
}
