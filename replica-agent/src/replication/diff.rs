//! Diffing a slave's last committed session against a fresh master session.
//!
//! The result is a [`ReplicationPlan`]: for every source, the disjoint sets of
//! files to download, to delete and to keep. Diffing is pure; the same inputs
//! always produce the same plan.

use crate::fs::fingerprint::FileFingerprint;
use crate::replication::session::{ReplicationSession, SourceItems};
use crate::replication::source::Source;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Nothing trustworthy to diff against: fetch every file
    Full,
    /// Diff against the previously committed session of the same lineage
    Incremental,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Full => f.write_str("full"),
            Strategy::Incremental => f.write_str("incremental"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePlan {
    /// New or modified files, with the fingerprint the download must match
    pub to_download: BTreeMap<String, FileFingerprint>,
    /// Files only present in the previous session
    pub to_delete: BTreeSet<String>,
    /// Files present in both sessions with equal fingerprints
    pub unchanged: BTreeSet<String>,
}

impl SourcePlan {
    pub fn download_bytes(&self) -> u64 {
        self.to_download.values().map(|f| f.size).sum()
    }

    pub fn is_noop(&self) -> bool {
        self.to_download.is_empty() && self.to_delete.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPlan {
    pub strategy: Strategy,
    pub master_uuid: String,
    pub session_uuid: String,
    pub sources: BTreeMap<Source, SourcePlan>,
}

impl ReplicationPlan {
    pub fn source(&self, source: Source) -> Option<&SourcePlan> {
        self.sources.get(&source)
    }

    pub fn download_count(&self) -> usize {
        self.sources.values().map(|p| p.to_download.len()).sum()
    }

    pub fn download_bytes(&self) -> u64 {
        self.sources.values().map(|p| p.download_bytes()).sum()
    }

    pub fn delete_count(&self) -> usize {
        self.sources.values().map(|p| p.to_delete.len()).sum()
    }

    pub fn unchanged_count(&self) -> usize {
        self.sources.values().map(|p| p.unchanged.len()).sum()
    }

    pub fn is_noop(&self) -> bool {
        self.sources.values().all(|p| p.is_noop())
    }
}

/// Pick the strategy for diffing `current` against `previous`.
///
/// A different master UUID means the master index was re-created; its files
/// share names but not history with ours, so only a full round is safe.
pub fn strategy_for(
    previous: Option<&ReplicationSession>,
    current: &ReplicationSession,
) -> Strategy {
    match previous {
        Some(previous) if previous.master_uuid() == current.master_uuid() => Strategy::Incremental,
        _ => Strategy::Full,
    }
}

/// Classify every file of every source present in either session.
pub fn diff(
    previous: Option<&ReplicationSession>,
    current: &ReplicationSession,
) -> ReplicationPlan {
    let strategy = strategy_for(previous, current);
    let empty = SourceItems::new();

    let mut sources: BTreeSet<Source> = current.items().keys().copied().collect();
    if let Some(previous) = previous {
        sources.extend(previous.items().keys().copied());
    }

    let sources = sources
        .into_iter()
        .map(|source| {
            let new_items = current.source_files(source).unwrap_or(&empty);
            let old_items = previous
                .and_then(|p| p.source_files(source))
                .unwrap_or(&empty);
            (source, diff_source(strategy, old_items, new_items))
        })
        .collect();

    ReplicationPlan {
        strategy,
        master_uuid: current.master_uuid().to_string(),
        session_uuid: current.session_uuid().to_string(),
        sources,
    }
}

fn diff_source(strategy: Strategy, old_items: &SourceItems, new_items: &SourceItems) -> SourcePlan {
    let mut plan = SourcePlan::default();

    for (name, fingerprint) in new_items {
        let up_to_date =
            strategy == Strategy::Incremental && old_items.get(name) == Some(fingerprint);
        if up_to_date {
            plan.unchanged.insert(name.clone());
        } else {
            plan.to_download.insert(name.clone(), *fingerprint);
        }
    }

    for name in old_items.keys() {
        if !new_items.contains_key(name) {
            plan.to_delete.insert(name.clone());
        }
    }

    plan
}
