//! Logical file groups of one index instance.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of file groups replicated for an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Main index segment files
    Index,
    /// Facet taxonomy index
    Taxonomy,
    /// Free-form resource files attached to the index
    Resources,
    /// Schema definitions (fields, analyzers)
    Metadata,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::Index,
        Source::Taxonomy,
        Source::Resources,
        Source::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Index => "index",
            Source::Taxonomy => "taxonomy",
            Source::Resources => "resources",
            Source::Metadata => "metadata",
        }
    }

    /// Whether `name` is a commit point readers use to discover a generation.
    ///
    /// Markers are published after every other file of the source.
    pub fn is_commit_marker(&self, name: &str) -> bool {
        match self {
            Source::Index | Source::Taxonomy => name.starts_with("segments"),
            Source::Resources | Source::Metadata => false,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| format!("Unknown replication source: {}", s))
    }
}
