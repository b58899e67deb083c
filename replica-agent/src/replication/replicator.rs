//! Slave-side orchestration of replication rounds.
//!
//! An [`IndexReplicator`] runs rounds for one index, one at a time. A
//! [`ReplicaNode`] groups the replicators of every configured index; distinct
//! indexes replicate independently.

use crate::config::Config;
use crate::replication::diff::{diff, Strategy};
use crate::replication::layout::IndexLayout;
use crate::replication::process::{ProcessOptions, ProcessReport, ReplicationProcess};
use crate::replication::session::ReplicationSession;
use crate::replication::store::SessionStore;
use crate::transfer::client::MasterClient;
use crate::transfer::progress::{format_speed, ProgressTracker, TransferCounters, TransferProgress};
use crate::utils::errors::ReplicationError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 1000;

/// Notifications for readers that need to know when to refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ReplicationEvent {
    #[serde(rename = "round_started")]
    RoundStarted {
        index: String,
        session_uuid: String,
        strategy: Strategy,
        files_to_download: usize,
        bytes_to_download: u64,
    },

    #[serde(rename = "progress")]
    Progress { index: String, progress: TransferProgress },

    #[serde(rename = "completed")]
    Completed(ReplicationStatus),

    #[serde(rename = "failed")]
    Failed(ReplicationStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundState {
    Done,
    Failed,
}

/// Outcome of the most recent round of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub index: String,
    pub state: RoundState,
    pub strategy: Option<Strategy>,
    pub master_uuid: Option<String>,
    pub session_uuid: Option<String>,
    pub files_downloaded: usize,
    pub bytes_downloaded: u64,
    pub files_deleted: usize,
    pub files_unchanged: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

/// What is known about a round so far, kept for the failure report
#[derive(Default)]
struct RoundInfo {
    strategy: Option<Strategy>,
    master_uuid: Option<String>,
    session_uuid: Option<String>,
}

pub struct IndexReplicator {
    index: String,
    layout: IndexLayout,
    store: SessionStore,
    client: Arc<dyn MasterClient>,
    options: ProcessOptions,
    round: Arc<tokio::sync::Mutex<()>>,
    cancel: Mutex<Option<CancellationToken>>,
    last_status: RwLock<Option<ReplicationStatus>>,
    events: broadcast::Sender<ReplicationEvent>,
}

impl IndexReplicator {
    pub fn new(
        index: impl Into<String>,
        layout: IndexLayout,
        client: Arc<dyn MasterClient>,
        options: ProcessOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let index = index.into();
        sweep_work_dir(&index, &layout);
        Self {
            index,
            store: SessionStore::new(&layout.session_file),
            layout,
            client,
            options,
            round: Arc::new(tokio::sync::Mutex::new(())),
            cancel: Mutex::new(None),
            last_status: RwLock::new(None),
            events,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.round.try_lock().is_err()
    }

    pub async fn last_status(&self) -> Option<ReplicationStatus> {
        self.last_status.read().await.clone()
    }

    /// The session the live directories currently reflect
    pub fn current_session(&self) -> Result<Option<ReplicationSession>> {
        self.store.load()
    }

    /// Ask the in-flight round to stop. Returns false when nothing runs.
    ///
    /// Has no effect once the round started committing.
    pub fn cancel(&self) -> bool {
        match self.cancel.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(token) => {
                    info!(index = %self.index, "Cancelling replication round");
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Forget the committed session so the next round is a full one.
    pub fn reset_session(&self) -> Result<()> {
        let _round = self.claim_round()?;
        self.store.clear()?;
        info!(index = %self.index, "Cleared replication session, next round is full");
        Ok(())
    }

    /// Run one round. Fails immediately when a round is already in flight.
    ///
    /// A round that starts but does not complete is reported through the
    /// returned status, not as an `Err`.
    pub async fn replicate(&self) -> Result<ReplicationStatus> {
        let round = self.claim_round()?;
        Ok(self.run_claimed(round).await)
    }

    /// Claim the round slot now and run the round in the background.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<ReplicationStatus>> {
        let round = self.claim_round()?;
        let replicator = Arc::clone(self);
        Ok(tokio::spawn(async move { replicator.run_claimed(round).await }))
    }

    fn claim_round(&self) -> Result<OwnedMutexGuard<()>> {
        Arc::clone(&self.round)
            .try_lock_owned()
            .map_err(|_| ReplicationError::AlreadyRunning(self.index.clone()))
    }

    async fn run_claimed(&self, _round: OwnedMutexGuard<()>) -> ReplicationStatus {
        let token = CancellationToken::new();
        self.set_cancel(Some(token.clone()));

        let started_at = Utc::now();
        let mut info = RoundInfo::default();
        let result = self.run_round(&token, &mut info).await;

        self.set_cancel(None);
        let status = self.build_status(started_at, info, result);

        let event = match status.state {
            RoundState::Done => ReplicationEvent::Completed(status.clone()),
            RoundState::Failed => ReplicationEvent::Failed(status.clone()),
        };
        let _ = self.events.send(event);
        *self.last_status.write().await = Some(status.clone());

        status
    }

    async fn run_round(
        &self,
        cancel: &CancellationToken,
        info: &mut RoundInfo,
    ) -> Result<ProcessReport> {
        let session = self.client.new_session(&self.index).await?;
        info.master_uuid = Some(session.master_uuid().to_string());
        info.session_uuid = Some(session.session_uuid().to_string());

        let result = self.apply_session(&session, cancel, info).await;

        if let Err(e) = self.client.release_session(session.session_uuid()).await {
            warn!(
                index = %self.index,
                session = %session.session_uuid(),
                error = %e,
                "Failed to release session"
            );
        }
        result
    }

    async fn apply_session(
        &self,
        session: &ReplicationSession,
        cancel: &CancellationToken,
        info: &mut RoundInfo,
    ) -> Result<ProcessReport> {
        session.validate_names()?;
        let previous = self.store.load()?;
        let plan = diff(previous.as_ref(), session);
        info.strategy = Some(plan.strategy);

        info!(
            index = %self.index,
            session = %plan.session_uuid,
            strategy = %plan.strategy,
            download = plan.download_count(),
            delete = plan.delete_count(),
            unchanged = plan.unchanged_count(),
            "Starting replication round"
        );
        let _ = self.events.send(ReplicationEvent::RoundStarted {
            index: self.index.clone(),
            session_uuid: plan.session_uuid.clone(),
            strategy: plan.strategy,
            files_to_download: plan.download_count(),
            bytes_to_download: plan.download_bytes(),
        });

        let mut process = ReplicationProcess::new(
            plan,
            self.layout.clone(),
            Arc::clone(&self.client),
            self.options.clone(),
            cancel.clone(),
        )?;

        let stop_progress = CancellationToken::new();
        let progress_task =
            self.spawn_progress_broadcaster(process.counters(), stop_progress.clone());

        let result = process.run(&self.store, session).await;

        stop_progress.cancel();
        let _ = progress_task.await;
        result
    }

    fn spawn_progress_broadcaster(
        &self,
        counters: Arc<TransferCounters>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let index = self.index.clone();
        let period = self.options.progress_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut tracker = ProgressTracker::new();

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }

                let progress = tracker.sample(&counters);
                tracing::trace!(
                    index = %index,
                    percent = progress.percent_complete,
                    speed = %format_speed(progress.bytes_per_second),
                    "Replication progress"
                );

                // No subscribers is fine
                let _ = events.send(ReplicationEvent::Progress {
                    index: index.clone(),
                    progress,
                });
            }
        })
    }

    fn build_status(
        &self,
        started_at: DateTime<Utc>,
        info: RoundInfo,
        result: Result<ProcessReport>,
    ) -> ReplicationStatus {
        let (state, report, error, error_code) = match result {
            Ok(report) => (RoundState::Done, report, None, None),
            Err(e) => {
                error!(
                    index = %self.index,
                    error = %e,
                    class = ?e.class(),
                    "Replication round failed"
                );
                (
                    RoundState::Failed,
                    ProcessReport::default(),
                    Some(e.to_string()),
                    Some(e.code().to_string()),
                )
            }
        };

        ReplicationStatus {
            index: self.index.clone(),
            state,
            strategy: info.strategy,
            master_uuid: info.master_uuid,
            session_uuid: info.session_uuid,
            files_downloaded: report.files_downloaded,
            bytes_downloaded: report.bytes_downloaded,
            files_deleted: report.files_deleted,
            files_unchanged: report.files_unchanged,
            started_at,
            completed_at: Utc::now(),
            error,
            error_code,
        }
    }

    fn set_cancel(&self, token: Option<CancellationToken>) {
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = token;
        }
    }
}

/// Remove staging areas left behind by a process that died mid-round.
fn sweep_work_dir(index: &str, layout: &IndexLayout) {
    let entries = match std::fs::read_dir(&layout.work_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return,
        Err(e) => {
            warn!(index = %index, error = %e, "Cannot list replication work directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match removed {
            Ok(()) => info!(index = %index, path = %path.display(), "Removed stale staging area"),
            Err(e) => warn!(
                index = %index,
                path = %path.display(),
                error = %e,
                "Failed to remove stale staging area"
            ),
        }
    }
}

/// Every replicated index of this slave, by name
#[derive(Clone, Default)]
pub struct ReplicaNode {
    replicators: Arc<BTreeMap<String, Arc<IndexReplicator>>>,
}

impl ReplicaNode {
    pub fn new(replicators: impl IntoIterator<Item = IndexReplicator>) -> Self {
        let replicators = replicators
            .into_iter()
            .map(|replicator| (replicator.index().to_string(), Arc::new(replicator)))
            .collect();
        Self {
            replicators: Arc::new(replicators),
        }
    }

    pub fn from_config(config: &Config, client: Arc<dyn MasterClient>) -> Self {
        let options = ProcessOptions {
            permit_budget: config.transfer.permit_budget,
            progress_interval: Duration::from_millis(config.transfer.progress_interval_ms),
        };

        Self::new(config.indexes.iter().map(|index| {
            IndexReplicator::new(
                index.name.clone(),
                IndexLayout::new(config.index_root(index)),
                Arc::clone(&client),
                options.clone(),
            )
        }))
    }

    pub fn indexes(&self) -> impl Iterator<Item = &str> {
        self.replicators.keys().map(String::as_str)
    }

    pub fn replicator(&self, index: &str) -> Result<&Arc<IndexReplicator>> {
        self.replicators
            .get(index)
            .ok_or_else(|| ReplicationError::UnknownIndex(index.to_string()))
    }

    /// Run one round on every index concurrently
    pub async fn replicate_all(&self) -> Vec<(String, Result<ReplicationStatus>)> {
        let rounds = self.replicators.iter().map(|(name, replicator)| async move {
            (name.clone(), replicator.replicate().await)
        });
        futures_util::future::join_all(rounds).await
    }

    pub fn running_count(&self) -> usize {
        self.replicators.values().filter(|r| r.is_running()).count()
    }

    /// Returns how many rounds were asked to stop
    pub fn cancel_all(&self) -> usize {
        self.replicators.values().filter(|r| r.cancel()).count()
    }
}
