//! Master-side session registry.
//!
//! A [`ReplicationMaster`] owns one index directory and hands out immutable
//! session manifests over it. Sessions stay cached until the slave releases
//! them or they sit idle past the configured TTL.
//!
//! Each session pins its files: they are hard-linked (copied when linking is
//! not possible) into `replication-snapshots/<session>/` when the session is
//! created, and served from there. Segment merges and commits on the live
//! directories do not affect a session in flight. The snapshot is removed
//! with the session.

use crate::fs::fingerprint::FileFingerprint;
use crate::fs::walker::WalkOptions;
use crate::replication::catalog::ReplicationCatalog;
use crate::replication::layout::{CatalogFilter, IndexLayout};
use crate::replication::session::ReplicationSession;
use crate::replication::source::Source;
use crate::transfer::client::{ByteStream, MasterClient};
use crate::utils::errors::ReplicationError;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Directory holding the pinned files of one session, removed on drop
struct SessionSnapshot {
    session_uuid: String,
    dir: PathBuf,
}

impl SessionSnapshot {
    fn create(layout: &IndexLayout, session_uuid: &str) -> Result<Self> {
        let dir = layout.snapshot_dir.join(session_uuid);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            session_uuid: session_uuid.to_string(),
            dir,
        })
    }

    /// Pin the current files of `source` and catalog the pinned copies.
    fn pin(&self, layout: &IndexLayout, source: Source) -> Result<ReplicationCatalog> {
        let live = ReplicationCatalog::for_layout(layout, source)?;
        let live_dir = layout.source_dir(source);
        let pinned_dir = layout.snapshot_source_dir(&self.session_uuid, source);
        std::fs::create_dir_all(&pinned_dir)?;

        for name in live.entries().keys() {
            link_or_copy(&live_dir.join(name), &pinned_dir.join(name))?;
        }

        let filter = CatalogFilter::Directory(WalkOptions::default());
        ReplicationCatalog::scan(source, &pinned_dir, &filter)
    }
}

impl Drop for SessionSnapshot {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.dir.display(),
                error = %e,
                "Failed to remove session snapshot"
            ),
        }
    }
}

/// Hard-link `src` to `dst`, falling back to a copy that keeps the fingerprint.
///
/// A file that vanished since it was listed (merged away) is skipped.
fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    let link_error = match std::fs::hard_link(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => e,
    };
    debug!(path = %src.display(), error = %link_error, "Hard link failed, copying");

    let fingerprint = match FileFingerprint::from_path(src) {
        Ok(fingerprint) => fingerprint,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    std::fs::copy(src, dst)?;
    let file = std::fs::OpenOptions::new().write(true).open(dst)?;
    fingerprint.stamp(&file)?;
    Ok(())
}

/// Remove snapshots of sessions that did not survive a restart
fn sweep_snapshots(index: &str, layout: &IndexLayout) -> Result<()> {
    match std::fs::remove_dir_all(&layout.snapshot_dir) {
        Ok(()) => {
            info!(index = %index, "Removed session snapshots of a previous run");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

struct ActiveSession {
    session: Arc<ReplicationSession>,
    /// Pinned files, deleted when the session is dropped
    _snapshot: SessionSnapshot,
    last_active: Mutex<Instant>,
}

impl ActiveSession {
    fn touch(&self) {
        if let Ok(mut last_active) = self.last_active.lock() {
            *last_active = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_active
            .lock()
            .map(|last_active| now.saturating_duration_since(*last_active))
            .unwrap_or_default()
    }
}

pub struct ReplicationMaster {
    index: String,
    layout: IndexLayout,
    master_uuid: String,
    sessions: DashMap<String, ActiveSession>,
}

impl ReplicationMaster {
    /// Open the index at `layout`, creating its master UUID on first use.
    ///
    /// The index directory must exist; the other sources are optional.
    pub fn open(index: impl Into<String>, layout: IndexLayout) -> Result<Self> {
        let index = index.into();

        if !layout.index_dir.is_dir() {
            return Err(ReplicationError::MissingSource {
                src: Source::Index,
                path: layout.index_dir.clone(),
            });
        }

        let master_uuid = load_or_create_uuid(&layout)?;
        sweep_snapshots(&index, &layout)?;
        info!(index = %index, master_uuid = %master_uuid, "Opened replication master");

        Ok(Self {
            index,
            layout,
            master_uuid,
            sessions: DashMap::new(),
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    pub fn master_uuid(&self) -> &str {
        &self.master_uuid
    }

    /// Pin every source and cache the resulting manifest.
    pub fn new_session(&self) -> Result<Arc<ReplicationSession>> {
        let session_uuid = uuid::Uuid::new_v4().to_string();
        let snapshot = SessionSnapshot::create(&self.layout, &session_uuid)?;

        let catalogs = Source::ALL
            .iter()
            .map(|source| snapshot.pin(&self.layout, *source))
            .collect::<Result<Vec<_>>>()?;

        let session = Arc::new(ReplicationSession::from_catalogs(
            self.master_uuid.clone(),
            session_uuid.clone(),
            catalogs,
        ));

        self.sessions.insert(
            session_uuid.clone(),
            ActiveSession {
                session: Arc::clone(&session),
                _snapshot: snapshot,
                last_active: Mutex::new(Instant::now()),
            },
        );

        info!(
            index = %self.index,
            session = %session_uuid,
            files = session.file_count(),
            size = session.size(),
            "Created replication session"
        );
        Ok(session)
    }

    pub fn session(&self, session_uuid: &str) -> Option<Arc<ReplicationSession>> {
        self.sessions.get(session_uuid).map(|active| Arc::clone(&active.session))
    }

    pub fn has_session(&self, session_uuid: &str) -> bool {
        self.sessions.contains_key(session_uuid)
    }

    /// Resolve the pinned path of a file served by `session_uuid`.
    pub fn open_file(&self, session_uuid: &str, source: Source, name: &str) -> Result<PathBuf> {
        let active = self
            .sessions
            .get(session_uuid)
            .ok_or_else(|| ReplicationError::UnknownSession(session_uuid.to_string()))?;

        if active.session.item(source, name).is_none() {
            return Err(ReplicationError::UnknownFile {
                src: source,
                name: name.to_string(),
            });
        }
        active.touch();

        Ok(self.layout.snapshot_source_dir(session_uuid, source).join(name))
    }

    /// Returns whether the session was still cached.
    pub fn release_session(&self, session_uuid: &str) -> bool {
        let released = self.sessions.remove(session_uuid).is_some();
        if released {
            debug!(index = %self.index, session = %session_uuid, "Released replication session");
        }
        released
    }

    /// Release every session idle for longer than `max_idle`.
    pub fn expire_inactive(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for(now) > max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        for session_uuid in &expired {
            if self.sessions.remove(session_uuid).is_some() {
                warn!(
                    index = %self.index,
                    session = %session_uuid,
                    "Expired inactive replication session"
                );
            }
        }
        expired
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn close(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        if count > 0 {
            info!(index = %self.index, sessions = count, "Closed replication master");
        }
    }
}

fn load_or_create_uuid(layout: &IndexLayout) -> Result<String> {
    match std::fs::read_to_string(&layout.uuid_file) {
        Ok(content) if !content.trim().is_empty() => return Ok(content.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let master_uuid = uuid::Uuid::new_v4().to_string();
    std::fs::write(&layout.uuid_file, &master_uuid)?;
    Ok(master_uuid)
}

/// Index name to master, shared by the HTTP service and in-process slaves.
#[derive(Clone, Default)]
pub struct MasterRegistry {
    masters: Arc<BTreeMap<String, Arc<ReplicationMaster>>>,
}

impl MasterRegistry {
    pub fn new(masters: impl IntoIterator<Item = ReplicationMaster>) -> Self {
        let masters = masters
            .into_iter()
            .map(|master| (master.index().to_string(), Arc::new(master)))
            .collect();
        Self {
            masters: Arc::new(masters),
        }
    }

    /// Open one master per `(name, root)` pair
    pub fn open<I, P>(indexes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, P)>,
        P: Into<PathBuf>,
    {
        let masters = indexes
            .into_iter()
            .map(|(name, root)| ReplicationMaster::open(name, IndexLayout::new(root)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(masters))
    }

    /// Every subdirectory of `indexes_dir` is one index, named after it.
    pub fn discover(indexes_dir: &std::path::Path) -> Result<Self> {
        let mut indexes = Vec::new();
        for entry in std::fs::read_dir(indexes_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "Skipping index with non UTF-8 name");
                continue;
            };
            indexes.push((name, entry.path()));
        }
        Self::open(indexes)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &str> {
        self.masters.keys().map(String::as_str)
    }

    pub fn master(&self, index: &str) -> Result<&Arc<ReplicationMaster>> {
        self.masters
            .get(index)
            .ok_or_else(|| ReplicationError::UnknownIndex(index.to_string()))
    }

    pub fn owner_of(&self, session_uuid: &str) -> Result<&Arc<ReplicationMaster>> {
        self.masters
            .values()
            .find(|master| master.has_session(session_uuid))
            .ok_or_else(|| ReplicationError::UnknownSession(session_uuid.to_string()))
    }

    pub fn open_file(&self, session_uuid: &str, source: Source, name: &str) -> Result<PathBuf> {
        self.owner_of(session_uuid)?.open_file(session_uuid, source, name)
    }

    pub fn release_session(&self, session_uuid: &str) -> bool {
        self.masters
            .values()
            .any(|master| master.release_session(session_uuid))
    }

    pub fn expire_inactive(&self, max_idle: Duration) -> Vec<String> {
        self.masters
            .values()
            .flat_map(|master| master.expire_inactive(max_idle))
            .collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.masters.values().map(|master| master.active_sessions()).sum()
    }

    pub fn close(&self) {
        for master in self.masters.values() {
            master.close();
        }
    }
}

#[async_trait]
impl MasterClient for MasterRegistry {
    async fn new_session(&self, index: &str) -> Result<ReplicationSession> {
        let master = Arc::clone(self.master(index)?);
        let session = tokio::task::spawn_blocking(move || master.new_session())
            .await
            .map_err(std::io::Error::other)??;
        Ok(session.as_ref().clone())
    }

    async fn get_file(&self, session_uuid: &str, source: Source, name: &str) -> Result<ByteStream> {
        let path = self.open_file(session_uuid, source, name)?;
        let file = tokio::fs::File::open(&path).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn release_session(&self, session_uuid: &str) -> Result<()> {
        MasterRegistry::release_session(self, session_uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use tempfile::TempDir;

    fn index_root(dir: &TempDir, name: &str) -> PathBuf {
        let root = dir.path().join(name);
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::write(root.join("data/seg1"), vec![1u8; 100]).unwrap();
        std::fs::write(root.join("data/segments_1"), b"gen1").unwrap();
        std::fs::create_dir_all(root.join("resources")).unwrap();
        std::fs::write(root.join("resources/stopwords.txt"), b"a\nthe\n").unwrap();
        std::fs::write(root.join("fields.json"), b"{}").unwrap();
        root
    }

    #[test]
    fn test_master_uuid_is_persistent() {
        let dir = TempDir::new().unwrap();
        let root = index_root(&dir, "books");

        let first = ReplicationMaster::open("books", IndexLayout::new(&root)).unwrap();
        let second = ReplicationMaster::open("books", IndexLayout::new(&root)).unwrap();
        assert_eq!(first.master_uuid(), second.master_uuid());

        std::fs::remove_file(root.join("master.uuid")).unwrap();
        let recreated = ReplicationMaster::open("books", IndexLayout::new(&root)).unwrap();
        assert_ne!(first.master_uuid(), recreated.master_uuid());
    }

    #[test]
    fn test_missing_index_dir() {
        let dir = TempDir::new().unwrap();
        let err = ReplicationMaster::open("ghost", IndexLayout::new(dir.path().join("ghost")))
            .err()
            .unwrap();
        assert!(matches!(err, ReplicationError::MissingSource { src: Source::Index, .. }));
    }

    #[test]
    fn test_new_session_covers_all_sources() {
        let dir = TempDir::new().unwrap();
        let layout = IndexLayout::new(index_root(&dir, "books"));
        let master = ReplicationMaster::open("books", layout).unwrap();

        let session = master.new_session().unwrap();
        assert_eq!(session.master_uuid(), master.master_uuid());
        assert_eq!(session.file_count(), 4);
        assert_eq!(session.size(), 100 + 4 + 6 + 2);
        assert!(session.item(Source::Metadata, "fields.json").is_some());
        assert!(session.source_files(Source::Taxonomy).unwrap().is_empty());
        assert!(master.session(session.session_uuid()).is_some());
    }

    #[test]
    fn test_open_file_validation() {
        let dir = TempDir::new().unwrap();
        let root = index_root(&dir, "books");
        let master = ReplicationMaster::open("books", IndexLayout::new(&root)).unwrap();
        let session = master.new_session().unwrap();

        let path = master
            .open_file(session.session_uuid(), Source::Index, "seg1")
            .unwrap();
        assert_eq!(
            path,
            root.join("replication-snapshots")
                .join(session.session_uuid())
                .join("index/seg1")
        );

        let err = master.open_file("nope", Source::Index, "seg1").unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownSession(_)));

        let err = master
            .open_file(session.session_uuid(), Source::Index, "seg9")
            .unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownFile { .. }));
    }

    #[tokio::test]
    async fn test_session_survives_live_changes() {
        let dir = TempDir::new().unwrap();
        let root = index_root(&dir, "books");
        let registry = MasterRegistry::open([("books".to_string(), root.clone())]).unwrap();
        let session = registry.master("books").unwrap().new_session().unwrap();

        // A merge drops seg1, a rewrite keeps the size of stopwords.txt
        std::fs::remove_file(root.join("data/seg1")).unwrap();
        std::fs::write(root.join("resources/stopwords.txt"), b"x\ny\nz\n").unwrap();

        let read = |source: Source, name: &'static str| {
            let registry = registry.clone();
            let session_uuid = session.session_uuid().to_string();
            async move {
                let chunks: Vec<bytes::Bytes> = registry
                    .get_file(&session_uuid, source, name)
                    .await
                    .unwrap()
                    .try_collect()
                    .await
                    .unwrap();
                chunks.concat()
            }
        };
        assert_eq!(read(Source::Index, "seg1").await, vec![1u8; 100]);
        assert_eq!(read(Source::Resources, "stopwords.txt").await, b"a\nthe\n".to_vec());

        let snapshot = root.join("replication-snapshots").join(session.session_uuid());
        assert!(snapshot.is_dir());
        assert!(registry.release_session(session.session_uuid()));
        assert!(!snapshot.exists());
    }

    #[test]
    fn test_snapshots_removed_on_expire_close_and_reopen() {
        let dir = TempDir::new().unwrap();
        let root = index_root(&dir, "books");
        let snapshots = root.join("replication-snapshots");

        let master = ReplicationMaster::open("books", IndexLayout::new(&root)).unwrap();
        let expiring = master.new_session().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        master.expire_inactive(Duration::from_millis(5));
        assert!(!snapshots.join(expiring.session_uuid()).exists());

        let closing = master.new_session().unwrap();
        master.close();
        assert!(!snapshots.join(closing.session_uuid()).exists());

        // Left behind by a master that died with sessions open
        let orphan = master.new_session().unwrap();
        std::mem::forget(master);
        assert!(snapshots.join(orphan.session_uuid()).exists());
        ReplicationMaster::open("books", IndexLayout::new(&root)).unwrap();
        assert!(!snapshots.exists());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let layout = IndexLayout::new(index_root(&dir, "books"));
        let master = ReplicationMaster::open("books", layout).unwrap();
        let session = master.new_session().unwrap();

        assert!(master.release_session(session.session_uuid()));
        assert!(!master.release_session(session.session_uuid()));
        assert!(master
            .open_file(session.session_uuid(), Source::Index, "seg1")
            .is_err());
    }

    #[test]
    fn test_expire_inactive() {
        let dir = TempDir::new().unwrap();
        let layout = IndexLayout::new(index_root(&dir, "books"));
        let master = ReplicationMaster::open("books", layout).unwrap();
        let session = master.new_session().unwrap();

        assert!(master.expire_inactive(Duration::from_secs(600)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        let expired = master.expire_inactive(Duration::from_millis(5));
        assert_eq!(expired, vec![session.session_uuid().to_string()]);
        assert_eq!(master.active_sessions(), 0);
    }

    #[test]
    fn test_registry_discover_and_route() {
        let dir = TempDir::new().unwrap();
        index_root(&dir, "books");
        index_root(&dir, "music");
        std::fs::write(dir.path().join("README"), b"not an index").unwrap();

        let registry = MasterRegistry::discover(dir.path()).unwrap();
        assert_eq!(registry.indexes().collect::<Vec<_>>(), vec!["books", "music"]);
        assert!(matches!(
            registry.master("films").err().unwrap(),
            ReplicationError::UnknownIndex(_)
        ));

        let session = registry.master("music").unwrap().new_session().unwrap();
        assert_eq!(
            registry.owner_of(session.session_uuid()).unwrap().index(),
            "music"
        );
        assert!(registry.release_session(session.session_uuid()));
        assert!(!registry.release_session(session.session_uuid()));
    }

    #[tokio::test]
    async fn test_in_process_client() {
        let dir = TempDir::new().unwrap();
        index_root(&dir, "books");
        let registry = MasterRegistry::discover(dir.path()).unwrap();
        let client: Arc<dyn MasterClient> = Arc::new(registry.clone());

        let session = client.new_session("books").await.unwrap();
        let chunks: Vec<bytes::Bytes> = client
            .get_file(session.session_uuid(), Source::Index, "seg1")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 100);

        client.release_session(session.session_uuid()).await.unwrap();
        client.release_session(session.session_uuid()).await.unwrap();
        assert_eq!(registry.active_sessions(), 0);
    }
}
