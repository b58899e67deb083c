//! Replication session manifests.
//!
//! A session is the immutable list of files (with fingerprints) a master is
//! willing to serve for one replication round. It is built once, serialized to
//! the slave, and persisted by the slave after a successful commit.

use crate::fs::fingerprint::FileFingerprint;
use crate::replication::catalog::ReplicationCatalog;
use crate::replication::source::Source;
use crate::utils::errors::ReplicationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

/// Files of one source, by name
pub type SourceItems = BTreeMap<String, FileFingerprint>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SessionRecord")]
pub struct ReplicationSession {
    master_uuid: String,
    session_uuid: String,
    #[serde(rename = "files")]
    items: BTreeMap<Source, SourceItems>,
    size: u64,
    start_time: u64,
}

/// Wire shape, validated before it becomes a session
#[derive(Deserialize)]
struct SessionRecord {
    master_uuid: String,
    session_uuid: String,
    #[serde(rename = "files", default)]
    items: BTreeMap<Source, SourceItems>,
    size: u64,
    #[serde(default)]
    start_time: u64,
}

impl TryFrom<SessionRecord> for ReplicationSession {
    type Error = ReplicationError;

    fn try_from(record: SessionRecord) -> Result<Self, Self::Error> {
        let computed = total_size(&record.items);
        if computed != record.size {
            return Err(ReplicationError::InvalidSession(format!(
                "session {} declares {} bytes but its files sum to {}",
                record.session_uuid, record.size, computed
            )));
        }
        let session = Self {
            master_uuid: record.master_uuid,
            session_uuid: record.session_uuid,
            items: record.items,
            size: record.size,
            start_time: record.start_time,
        };
        session.validate_names()?;
        Ok(session)
    }
}

/// Whether `name` can be joined onto a directory without leaving it:
/// exactly one normal path component, no separators of either platform.
pub fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains(&['/', '\\', '\0'][..]) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(component)), None) if component == name
    )
}

fn total_size(items: &BTreeMap<Source, SourceItems>) -> u64 {
    items
        .values()
        .flat_map(|files| files.values())
        .map(|fingerprint| fingerprint.size)
        .sum()
}

impl ReplicationSession {
    /// Build a session; `size` is computed here and never again.
    pub fn new(
        master_uuid: impl Into<String>,
        session_uuid: impl Into<String>,
        items: BTreeMap<Source, SourceItems>,
    ) -> Self {
        let size = total_size(&items);
        Self {
            master_uuid: master_uuid.into(),
            session_uuid: session_uuid.into(),
            items,
            size,
            start_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    pub fn from_catalogs(
        master_uuid: impl Into<String>,
        session_uuid: impl Into<String>,
        catalogs: impl IntoIterator<Item = ReplicationCatalog>,
    ) -> Self {
        let items = catalogs
            .into_iter()
            .map(|catalog| (catalog.source(), catalog.into_entries()))
            .collect();
        Self::new(master_uuid, session_uuid, items)
    }

    pub fn master_uuid(&self) -> &str {
        &self.master_uuid
    }

    pub fn session_uuid(&self) -> &str {
        &self.session_uuid
    }

    pub fn items(&self) -> &BTreeMap<Source, SourceItems> {
        &self.items
    }

    /// Total bytes over every file of every source
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Creation instant, milliseconds since Unix epoch
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn source_files(&self, source: Source) -> Option<&SourceItems> {
        self.items.get(&source)
    }

    pub fn item(&self, source: Source, name: &str) -> Option<&FileFingerprint> {
        self.source_files(source).and_then(|files| files.get(name))
    }

    pub fn file_count(&self) -> usize {
        self.items.values().map(|files| files.len()).sum()
    }

    /// Reject a session whose id or file names would resolve outside the
    /// directories they are joined onto.
    pub fn validate_names(&self) -> Result<(), ReplicationError> {
        if !is_plain_file_name(&self.session_uuid) {
            return Err(ReplicationError::InvalidSession(format!(
                "session id {:?} is not a plain name",
                self.session_uuid
            )));
        }
        for (source, files) in &self.items {
            if let Some(name) = files.keys().find(|name| !is_plain_file_name(name)) {
                return Err(ReplicationError::InvalidSession(format!(
                    "session {} lists {}/{:?}, which is not a plain file name",
                    self.session_uuid, source, name
                )));
            }
        }
        Ok(())
    }
}
