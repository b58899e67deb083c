//! Execution of one replication round.
//!
//! ```text
//! Created -> Downloading -> Deleting -> Committing -> Done
//!     \__________\______________\___________\-----> Failed
//! ```
//!
//! Downloads only ever touch the staging area below the index's work
//! directory. The live directories are modified by [`ReplicationProcess::commit`]
//! alone: every staged non-marker file is renamed into place, then the commit
//! markers (`segments*`), then obsolete files are unlinked. A reader that
//! follows the markers therefore never sees a generation whose files are not
//! all present, and readers holding open handles keep reading the old inodes.

use crate::fs::fingerprint::FileFingerprint;
use crate::replication::catalog::ReplicationCatalog;
use crate::replication::diff::{ReplicationPlan, Strategy};
use crate::replication::layout::IndexLayout;
use crate::replication::session::{is_plain_file_name, ReplicationSession};
use crate::replication::source::Source;
use crate::replication::store::SessionStore;
use crate::transfer::client::MasterClient;
use crate::transfer::progress::{format_bytes, TransferCounters};
use crate::transfer::progress_stream::ProgressStream;
use crate::utils::errors::ReplicationError;
use crate::Result;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default download permit budget
pub const DEFAULT_PERMIT_BUDGET: u32 = 64;

/// Permits a download of `file_size` bytes takes out of a 64 permit budget.
///
/// | File size       | Permits | Effective concurrency |
/// |-----------------|---------|-----------------------|
/// | < 10 MB         | 1       | 64                    |
/// | 10 – 100 MB     | 2       | 32                    |
/// | 100 – 500 MB    | 16      | 4                     |
/// | 500 MB – 1 GB   | 32      | 2                     |
/// | > 1 GB          | 64      | 1                     |
fn concurrency_weight(file_size: u64) -> u32 {
    match file_size {
        0..=10_485_759 => 1,
        10_485_760..=104_857_599 => 2,
        104_857_600..=524_287_999 => 16,
        524_288_000..=1_073_741_823 => 32,
        _ => 64,
    }
}

/// Every path a round writes is `<dir>/<session_uuid>/...` or `<dir>/<name>`
fn check_plan_names(plan: &ReplicationPlan) -> Result<()> {
    if !is_plain_file_name(&plan.session_uuid) {
        return Err(ReplicationError::InvalidSession(format!(
            "session id {:?} is not a plain name",
            plan.session_uuid
        )));
    }
    for (source, source_plan) in &plan.sources {
        let names = source_plan
            .to_download
            .keys()
            .chain(&source_plan.to_delete)
            .chain(&source_plan.unchanged);
        for name in names {
            if !is_plain_file_name(name) {
                return Err(ReplicationError::InvalidSession(format!(
                    "{}/{:?} is not a plain file name",
                    source, name
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Total semaphore permits shared by concurrent downloads
    pub permit_budget: u32,
    /// Minimum delay between two byte-count reports of one download
    pub progress_interval: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            permit_budget: DEFAULT_PERMIT_BUDGET,
            progress_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Created,
    Downloading,
    Deleting,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Created => "created",
            ProcessState::Downloading => "downloading",
            ProcessState::Deleting => "deleting",
            ProcessState::Committing => "committing",
            ProcessState::Done => "done",
            ProcessState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a finished round did to the live directories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub files_downloaded: usize,
    pub bytes_downloaded: u64,
    pub files_deleted: usize,
    pub files_unchanged: usize,
}

pub struct ReplicationProcess {
    plan: ReplicationPlan,
    layout: IndexLayout,
    client: Arc<dyn MasterClient>,
    options: ProcessOptions,
    cancel: CancellationToken,
    counters: Arc<TransferCounters>,
    state: ProcessState,
    staging_root: PathBuf,
    deletions: BTreeMap<Source, BTreeSet<String>>,
    report: ProcessReport,
}

impl ReplicationProcess {
    /// Prepare a round and create its staging area.
    ///
    /// Failing to create the staging area is a fatal local error.
    pub fn new(
        plan: ReplicationPlan,
        layout: IndexLayout,
        client: Arc<dyn MasterClient>,
        options: ProcessOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        check_plan_names(&plan)?;
        let staging_root = layout.work_dir.join(&plan.session_uuid);

        for (source, source_plan) in &plan.sources {
            if source_plan.to_download.is_empty() {
                continue;
            }
            let dir = layout.staging_dir(&plan.session_uuid, *source);
            std::fs::create_dir_all(&dir).map_err(|e| {
                ReplicationError::Staging(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let counters = Arc::new(TransferCounters::new(
            plan.download_bytes(),
            plan.download_count(),
        ));

        Ok(Self {
            plan,
            layout,
            client,
            options,
            cancel,
            counters,
            state: ProcessState::Created,
            staging_root,
            deletions: BTreeMap::new(),
            report: ProcessReport::default(),
        })
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn plan(&self) -> &ReplicationPlan {
        &self.plan
    }

    pub fn counters(&self) -> Arc<TransferCounters> {
        Arc::clone(&self.counters)
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Drive the round from `Created` to `Done`, persisting `session` last.
    pub async fn run(
        &mut self,
        store: &SessionStore,
        session: &ReplicationSession,
    ) -> Result<ProcessReport> {
        self.download().await?;
        self.stage_deletions()?;
        self.commit()?;
        self.finish(store, session)?;
        Ok(self.report.clone())
    }

    /// Fetch every planned file into staging and verify it.
    pub async fn download(&mut self) -> Result<()> {
        self.transition(ProcessState::Created, ProcessState::Downloading, "download")?;

        let result = self.download_all().await;
        self.fail_on_error(result)
    }

    async fn download_all(&mut self) -> Result<()> {
        let budget = self.options.permit_budget.max(1);
        let semaphore = Arc::new(Semaphore::new(budget as usize));
        let cancel = self.cancel.child_token();
        let mut tasks: JoinSet<Result<u64>> = JoinSet::new();

        // Smallest first so the wide end of the semaphore fills up early
        let mut files: Vec<(Source, String, FileFingerprint)> = self
            .plan
            .sources
            .iter()
            .flat_map(|(source, plan)| {
                plan.to_download
                    .iter()
                    .map(move |(name, fingerprint)| (*source, name.clone(), *fingerprint))
            })
            .collect();
        files.sort_by_key(|(_, _, fingerprint)| fingerprint.size);

        info!(
            session = %self.plan.session_uuid,
            files = files.len(),
            bytes = %format_bytes(self.plan.download_bytes()),
            budget,
            "Downloading changed files"
        );

        for (source, name, expected) in files {
            let download = FileDownload {
                client: Arc::clone(&self.client),
                session_uuid: self.plan.session_uuid.clone(),
                target: self.layout.staging_dir(&self.plan.session_uuid, source).join(&name),
                source,
                name,
                expected,
                counters: Arc::clone(&self.counters),
                progress_interval: self.options.progress_interval,
            };
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let weight = concurrency_weight(expected.size).min(budget);

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_many_owned(weight) => {
                        permit.map_err(|e| {
                            ReplicationError::Staging(format!("download semaphore closed: {}", e))
                        })?
                    }
                    _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
                };
                download.run(&cancel).await
            });
        }

        let mut first_error: Option<ReplicationError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(std::io::Error::other(e).into()));
            match result {
                Ok(bytes) => {
                    self.report.files_downloaded += 1;
                    self.report.bytes_downloaded += bytes;
                }
                Err(e) => {
                    if first_error.is_none() {
                        warn!(
                            session = %self.plan.session_uuid,
                            error = %e,
                            "Download failed, cancelling round"
                        );
                        cancel.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record every file the commit will unlink.
    ///
    /// These are the plan's deletions plus, for a full round, every live file
    /// the new manifest does not list.
    pub fn stage_deletions(&mut self) -> Result<usize> {
        self.transition(ProcessState::Downloading, ProcessState::Deleting, "stage deletions")?;

        let result = self.collect_deletions();
        let deletions = self.fail_on_error(result)?;
        let count = deletions.values().map(BTreeSet::len).sum();
        self.deletions = deletions;
        Ok(count)
    }

    fn collect_deletions(&self) -> Result<BTreeMap<Source, BTreeSet<String>>> {
        let mut deletions = BTreeMap::new();

        for (source, plan) in &self.plan.sources {
            let mut names = plan.to_delete.clone();

            if self.plan.strategy == Strategy::Full {
                let live = ReplicationCatalog::for_layout(&self.layout, *source)?;
                names.extend(
                    live.entries()
                        .keys()
                        .filter(|name| {
                            !plan.to_download.contains_key(*name) && !plan.unchanged.contains(*name)
                        })
                        .cloned(),
                );
            }

            if !names.is_empty() {
                deletions.insert(*source, names);
            }
        }
        Ok(deletions)
    }

    /// Publish staged files and apply deletions.
    ///
    /// A cancellation observed here fails the round with nothing published;
    /// once renaming starts the commit runs to the end.
    pub fn commit(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return self.fail_on_error(Err(ReplicationError::Cancelled));
        }
        self.transition(ProcessState::Deleting, ProcessState::Committing, "commit")?;

        let result = self.publish();
        self.fail_on_error(result)
    }

    fn publish(&mut self) -> Result<()> {
        for (source, plan) in &self.plan.sources {
            if !plan.to_download.is_empty() {
                std::fs::create_dir_all(self.layout.source_dir(*source))?;
            }
        }

        for markers in [false, true] {
            for (source, plan) in &self.plan.sources {
                let staging = self.layout.staging_dir(&self.plan.session_uuid, *source);
                let live = self.layout.source_dir(*source);

                for name in plan.to_download.keys() {
                    if source.is_commit_marker(name) != markers {
                        continue;
                    }
                    std::fs::rename(staging.join(name), live.join(name))?;
                    debug!(source = %source, file = %name, "Published file");
                }
            }
        }

        let mut deleted = 0;
        for (source, names) in &self.deletions {
            let live = self.layout.source_dir(*source);
            for name in names {
                match std::fs::remove_file(live.join(name)) {
                    Ok(()) => deleted += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.report.files_deleted = deleted;
        self.report.files_unchanged = self.plan.unchanged_count();
        Ok(())
    }

    /// Remember `session` as the slave's current generation.
    pub fn finish(&mut self, store: &SessionStore, session: &ReplicationSession) -> Result<()> {
        self.expect_state(ProcessState::Committing, "finish")?;

        let result = store.save(session);
        self.fail_on_error(result)?;
        self.state = ProcessState::Done;
        self.discard_staging();

        info!(
            session = %self.plan.session_uuid,
            strategy = %self.plan.strategy,
            downloaded = self.report.files_downloaded,
            deleted = self.report.files_deleted,
            unchanged = self.report.files_unchanged,
            "Replication round committed"
        );
        Ok(())
    }

    /// Abandon the round; the live directories are left as they are.
    pub fn fail(&mut self) {
        if self.state != ProcessState::Done {
            self.state = ProcessState::Failed;
            self.discard_staging();
        }
    }

    pub fn report(&self) -> &ProcessReport {
        &self.report
    }

    fn expect_state(&self, expected: ProcessState, action: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(ReplicationError::InvalidState {
                action,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn transition(
        &mut self,
        from: ProcessState,
        to: ProcessState,
        action: &'static str,
    ) -> Result<()> {
        self.expect_state(from, action)?;
        self.state = to;
        Ok(())
    }

    fn fail_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.fail();
        }
        result
    }

    fn discard_staging(&self) {
        match std::fs::remove_dir_all(&self.staging_root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.staging_root.display(),
                error = %e,
                "Failed to discard staging area"
            ),
        }
    }
}

impl Drop for ReplicationProcess {
    fn drop(&mut self) {
        if self.state != ProcessState::Done {
            self.discard_staging();
        }
    }
}

/// One file fetch, owned by its download task
struct FileDownload {
    client: Arc<dyn MasterClient>,
    session_uuid: String,
    source: Source,
    name: String,
    expected: FileFingerprint,
    target: PathBuf,
    counters: Arc<TransferCounters>,
    progress_interval: Duration,
}

impl FileDownload {
    async fn run(self, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }

        let stream = self.client.get_file(&self.session_uuid, self.source, &self.name).await?;
        let counters = Arc::clone(&self.counters);
        let mut stream = ProgressStream::new(
            stream,
            self.progress_interval,
            Arc::new(move |delta| counters.add_bytes(delta)),
        );

        let mut file = tokio::fs::File::create(&self.target).await?;
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
            };
            match chunk {
                Some(chunk) => file.write_all(&chunk?).await?,
                None => break,
            }
        }
        file.flush().await?;

        let file = file.into_std().await;
        let expected = self.expected;
        let target = self.target.clone();
        let actual = tokio::task::spawn_blocking(move || -> std::io::Result<FileFingerprint> {
            expected.stamp(&file)?;
            file.sync_all()?;
            drop(file);
            FileFingerprint::from_path(&target)
        })
        .await
        .map_err(std::io::Error::other)??;

        if actual != expected {
            return Err(ReplicationError::ContentMismatch {
                src: self.source,
                name: self.name,
                expected,
                actual,
            });
        }

        self.counters.complete_file();
        debug!(source = %self.source, file = %self.name, size = actual.size, "Downloaded file");
        Ok(actual.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::diff::diff;
    use crate::replication::master::MasterRegistry;
    use crate::replication::testing::{write_file, FlakyClient};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        master_root: PathBuf,
        slave: IndexLayout,
        registry: MasterRegistry,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let master_root = dir.path().join("master/books");
        write_file(&master_root.join("data/a.seg"), b"new a content", 2_000);
        write_file(&master_root.join("data/c.seg"), b"c", 2_000);
        write_file(&master_root.join("data/segments_2"), b"gen2", 2_000);

        let slave = IndexLayout::new(dir.path().join("slave/books"));
        write_file(&slave.index_dir.join("a.seg"), b"old a", 1_000);
        write_file(&slave.index_dir.join("b.seg"), b"old b", 1_000);
        write_file(&slave.index_dir.join("segments_1"), b"gen1", 1_000);

        let registry = MasterRegistry::open([("books".to_string(), master_root.clone())]).unwrap();
        Fixture {
            _dir: dir,
            master_root,
            slave,
            registry,
        }
    }

    fn live_names(layout: &IndexLayout) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&layout.index_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn new_process(
        fx: &Fixture,
        client: Arc<dyn MasterClient>,
        session: &ReplicationSession,
    ) -> ReplicationProcess {
        ReplicationProcess::new(
            diff(None, session),
            fx.slave.clone(),
            client,
            ProcessOptions::default(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_concurrency_weight() {
        assert_eq!(concurrency_weight(0), 1);
        assert_eq!(concurrency_weight(50 * 1024 * 1024), 2);
        assert_eq!(concurrency_weight(2 * 1024 * 1024 * 1024), 64);
    }

    #[tokio::test]
    async fn test_full_round_replaces_live_files() {
        let fx = fixture();
        let client: Arc<dyn MasterClient> = Arc::new(fx.registry.clone());
        let session = client.new_session("books").await.unwrap();
        let store = SessionStore::new(&fx.slave.session_file);

        let mut process = new_process(&fx, Arc::clone(&client), &session);
        let staging = process.staging_root().to_path_buf();
        let report = process.run(&store, &session).await.unwrap();

        assert_eq!(process.state(), ProcessState::Done);
        assert_eq!(report.files_downloaded, 3);
        // b.seg and segments_1 are not in the new manifest
        assert_eq!(report.files_deleted, 2);
        assert_eq!(live_names(&fx.slave), vec!["a.seg", "c.seg", "segments_2"]);
        assert_eq!(std::fs::read(fx.slave.index_dir.join("a.seg")).unwrap(), b"new a content");
        assert_eq!(
            FileFingerprint::from_path(&fx.slave.index_dir.join("a.seg")).unwrap(),
            FileFingerprint::from_path(&fx.master_root.join("data/a.seg")).unwrap()
        );
        assert_eq!(store.load().unwrap(), Some(session));
        assert!(!staging.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_readers_keep_old_generation() {
        use std::io::Read;

        let fx = fixture();
        let client: Arc<dyn MasterClient> = Arc::new(fx.registry.clone());
        let session = client.new_session("books").await.unwrap();
        let store = SessionStore::new(&fx.slave.session_file);

        let mut reader_a = std::fs::File::open(fx.slave.index_dir.join("a.seg")).unwrap();
        let mut reader_b = std::fs::File::open(fx.slave.index_dir.join("b.seg")).unwrap();

        let mut process = new_process(&fx, client, &session);
        process.run(&store, &session).await.unwrap();

        let mut old_a = String::new();
        reader_a.read_to_string(&mut old_a).unwrap();
        let mut old_b = String::new();
        reader_b.read_to_string(&mut old_b).unwrap();
        assert_eq!(old_a, "old a");
        assert_eq!(old_b, "old b");
        assert!(!fx.slave.index_dir.join("b.seg").exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_live_untouched() {
        let fx = fixture();
        let client: Arc<dyn MasterClient> =
            Arc::new(FlakyClient::new(fx.registry.clone()).failing_on("c.seg"));
        let session = client.new_session("books").await.unwrap();
        let store = SessionStore::new(&fx.slave.session_file);
        let before = live_names(&fx.slave);

        let mut process = new_process(&fx, Arc::clone(&client), &session);
        let staging = process.staging_root().to_path_buf();
        let err = process.run(&store, &session).await.unwrap_err();

        assert!(matches!(err, ReplicationError::Network(_)));
        assert_eq!(process.state(), ProcessState::Failed);
        assert_eq!(live_names(&fx.slave), before);
        assert_eq!(std::fs::read(fx.slave.index_dir.join("a.seg")).unwrap(), b"old a");
        assert!(!staging.exists());
        assert!(store.load().unwrap().is_none());

        // A retry from the same starting point plans the same work
        assert_eq!(diff(None, &session), *process.plan());
    }

    #[tokio::test]
    async fn test_truncated_download_is_a_content_mismatch() {
        let fx = fixture();
        let client: Arc<dyn MasterClient> =
            Arc::new(FlakyClient::new(fx.registry.clone()).truncating("a.seg"));
        let session = client.new_session("books").await.unwrap();

        let mut process = new_process(&fx, client, &session);
        let err = process.download().await.unwrap_err();

        assert!(matches!(
            err,
            ReplicationError::ContentMismatch { ref name, .. } if name == "a.seg"
        ));
        assert_eq!(process.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_before_commit() {
        let fx = fixture();
        let client: Arc<dyn MasterClient> = Arc::new(fx.registry.clone());
        let session = client.new_session("books").await.unwrap();
        let cancel = CancellationToken::new();
        let before = live_names(&fx.slave);

        let mut process = ReplicationProcess::new(
            diff(None, &session),
            fx.slave.clone(),
            client,
            ProcessOptions::default(),
            cancel.clone(),
        )
        .unwrap();
        process.download().await.unwrap();
        process.stage_deletions().unwrap();

        cancel.cancel();
        let err = process.commit().unwrap_err();

        assert!(matches!(err, ReplicationError::Cancelled));
        assert_eq!(process.state(), ProcessState::Failed);
        assert_eq!(live_names(&fx.slave), before);
    }

    #[test]
    fn test_plan_with_escaping_name_is_rejected() {
        let fx = fixture();
        let mut index = crate::replication::session::SourceItems::new();
        index.insert("../../outside.seg".to_string(), FileFingerprint::new(5, 1_000));
        let session =
            ReplicationSession::new("master-1", "session-1", [(Source::Index, index)].into());

        let result = ReplicationProcess::new(
            diff(None, &session),
            fx.slave.clone(),
            Arc::new(fx.registry.clone()),
            ProcessOptions::default(),
            CancellationToken::new(),
        );

        assert!(matches!(result, Err(ReplicationError::InvalidSession(_))));
        assert!(!fx.slave.work_dir.exists());
    }

    #[tokio::test]
    async fn test_out_of_order_transition() {
        let fx = fixture();
        let client: Arc<dyn MasterClient> = Arc::new(fx.registry.clone());
        let session = client.new_session("books").await.unwrap();

        let mut process = new_process(&fx, client, &session);
        let err = process.commit().unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { action: "commit", .. }));
    }

    #[tokio::test]
    async fn test_dropping_discards_staging() {
        let fx = fixture();
        let client: Arc<dyn MasterClient> = Arc::new(fx.registry.clone());
        let session = client.new_session("books").await.unwrap();

        let mut process = new_process(&fx, client, &session);
        process.download().await.unwrap();
        let staging = process.staging_root().to_path_buf();
        assert!(staging.join("index/a.seg").exists());

        drop(process);
        assert!(!staging.exists());
        assert_eq!(std::fs::read(fx.slave.index_dir.join("a.seg")).unwrap(), b"old a");
    }
}
