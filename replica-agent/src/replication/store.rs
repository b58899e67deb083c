//! Slave-side persistence of the last committed session.
//!
//! The file lives outside the live index directories, so a restart resumes
//! incremental replication instead of starting over.

use crate::replication::session::ReplicationSession;
use crate::Result;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last committed session.
    ///
    /// A missing file means "never replicated". A file that cannot be parsed is
    /// reported and ignored, which makes the next round a full one.
    pub fn load(&self) -> Result<Option<ReplicationSession>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<ReplicationSession>(&content) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Ignoring unreadable replication session file"
                );
                Ok(None)
            }
        }
    }

    /// Persist `session` atomically (write to a temporary file, then rename).
    pub fn save(&self, session: &ReplicationSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(session)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
