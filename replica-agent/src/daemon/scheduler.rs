//! Cron-driven replication rounds.

use crate::config::Config;
use crate::replication::replicator::{ReplicaNode, RoundState};
use crate::utils::errors::ReplicationError;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct ReplicationScheduler {
    scheduler: Mutex<JobScheduler>,
    node: ReplicaNode,
}

impl ReplicationScheduler {
    pub async fn new(node: ReplicaNode) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            node,
        })
    }

    /// Run a round of `index` on every tick of the six-field `cron_expression`.
    ///
    /// A tick that finds a round of the same index still in flight is skipped.
    pub async fn schedule_index(&self, index: &str, cron_expression: &str) -> anyhow::Result<()> {
        // Fail now rather than on the first tick
        self.node.replicator(index)?;

        let node = self.node.clone();
        let name = index.to_string();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let node = node.clone();
            let name = name.clone();
            Box::pin(async move {
                let Ok(replicator) = node.replicator(&name) else { return };

                match replicator.replicate().await {
                    Ok(status) if status.state == RoundState::Done => {
                        tracing::debug!(
                            index = %name,
                            downloaded = status.files_downloaded,
                            "Scheduled round done"
                        );
                    }
                    Ok(status) => {
                        tracing::warn!(
                            index = %name,
                            error = ?status.error,
                            "Scheduled round failed"
                        );
                    }
                    Err(ReplicationError::AlreadyRunning(_)) => {
                        tracing::warn!(
                            index = %name,
                            "Skipping scheduled round: already running"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            index = %name,
                            error = %e,
                            "Scheduled round could not start"
                        );
                    }
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(index = %index, cron = %cron_expression, "Replication scheduled");
        Ok(())
    }

    /// Schedule every configured index that has a cron expression
    pub async fn init_schedules(&self, config: &Config) -> anyhow::Result<usize> {
        let mut count = 0;
        for index in &config.indexes {
            let Some(cron) = index.schedule.as_deref().filter(|c| !c.trim().is_empty()) else {
                continue;
            };
            self.schedule_index(&index.name, cron).await?;
            count += 1;
        }

        tracing::info!(count, "Cron schedules initialized");
        Ok(count)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
