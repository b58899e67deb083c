//! On-disk layout of one index instance.

use crate::fs::walker::WalkOptions;
use crate::replication::source::Source;
use std::path::{Path, PathBuf};

/// Schema files replicated as the metadata source
pub const METADATA_FILES: [&str; 2] = ["fields.json", "analyzers.json"];

/// Which files of a source directory belong to the catalog
#[derive(Debug, Clone)]
pub enum CatalogFilter {
    /// Every regular file directly in the directory, minus excludes
    Directory(WalkOptions),
    /// Only the listed names, when present
    Named(Vec<String>),
}

/// Directory layout shared by master and slave:
///
/// ```text
/// <root>/data/                    index source
/// <root>/taxonomy/                taxonomy source
/// <root>/resources/               resources source
/// <root>/fields.json, analyzers.json   metadata source
/// <root>/replication-work/        staging areas (slave)
/// <root>/replication-session.json last committed session (slave)
/// <root>/replication-snapshots/   files pinned per open session (master)
/// <root>/master.uuid              lineage identifier (master)
/// ```
#[derive(Debug, Clone)]
pub struct IndexLayout {
    pub root: PathBuf,
    pub index_dir: PathBuf,
    pub taxonomy_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub metadata_files: Vec<String>,
    pub work_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub session_file: PathBuf,
    pub uuid_file: PathBuf,
}

impl IndexLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index_dir: root.join("data"),
            taxonomy_dir: root.join("taxonomy"),
            resources_dir: root.join("resources"),
            metadata_files: METADATA_FILES.iter().map(|s| s.to_string()).collect(),
            work_dir: root.join("replication-work"),
            snapshot_dir: root.join("replication-snapshots"),
            session_file: root.join("replication-session.json"),
            uuid_file: root.join("master.uuid"),
            root,
        }
    }

    /// Live directory holding the files of `source`
    pub fn source_dir(&self, source: Source) -> &Path {
        match source {
            Source::Index => &self.index_dir,
            Source::Taxonomy => &self.taxonomy_dir,
            Source::Resources => &self.resources_dir,
            Source::Metadata => &self.root,
        }
    }

    pub fn catalog_filter(&self, source: Source) -> CatalogFilter {
        match source {
            Source::Metadata => CatalogFilter::Named(self.metadata_files.clone()),
            _ => CatalogFilter::Directory(WalkOptions::default()),
        }
    }

    /// Staging directory for one source of one session
    pub fn staging_dir(&self, session_uuid: &str, source: Source) -> PathBuf {
        self.work_dir.join(session_uuid).join(source.as_str())
    }

    /// Pinned copy of one source for one master session
    pub fn snapshot_source_dir(&self, session_uuid: &str, source: Source) -> PathBuf {
        self.snapshot_dir.join(session_uuid).join(source.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let layout = IndexLayout::new("/srv/books");
        assert_eq!(layout.source_dir(Source::Index), Path::new("/srv/books/data"));
        assert_eq!(layout.source_dir(Source::Metadata), Path::new("/srv/books"));
        assert_eq!(
            layout.staging_dir("abc", Source::Taxonomy),
            PathBuf::from("/srv/books/replication-work/abc/taxonomy")
        );
    }

    #[test]
    fn test_staging_is_outside_live_directories() {
        let layout = IndexLayout::new("/srv/books");
        let staging = layout.staging_dir("abc", Source::Index);
        let snapshot = layout.snapshot_source_dir("abc", Source::Index);
        for source in [Source::Index, Source::Taxonomy, Source::Resources] {
            assert!(!staging.starts_with(layout.source_dir(source)));
            assert!(!snapshot.starts_with(layout.source_dir(source)));
        }
    }
}
