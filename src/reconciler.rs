//! Status reconciliation loop.
//!
//! Every registered platform gets its own timer and its own query limit, so a
//! slow or failing backend only delays its own jobs. Each job is reconciled in
//! a separate task; writes go through `update_if_status` against the status
//! read at the start of the cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::credentials::Credential;
use crate::error::{TrainError, TrainResult};
use crate::state_machine::{JobPatch, JobStatus, Platform, StateMachine, TrainingJob, Transition};
use crate::store::{CredentialStore, JobStore};
use crate::trainer::{TrainerContext, TrainerRegistry};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub interval: Duration,
    pub query_timeout: Duration,
    /// Concurrent status queries allowed per platform.
    pub concurrency: BTreeMap<Platform, usize>,
}

impl ReconcileSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.poll_interval(),
            query_timeout: config.query_timeout(),
            concurrency: Platform::ALL
                .into_iter()
                .map(|platform| (platform, config.query_concurrency(platform)))
                .collect(),
        }
    }
}

/// What one reconciliation of one job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Updated { from: JobStatus, to: JobStatus },
    /// Another writer changed the job since it was read.
    Conflict,
    Rejected { from: JobStatus, to: JobStatus },
    /// Left as is, retried next cycle.
    QueryFailed(String),
    Terminal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub rejected: usize,
    pub failures: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        self.checked += 1;
        match outcome {
            ReconcileOutcome::Updated { .. } => self.updated += 1,
            ReconcileOutcome::Unchanged | ReconcileOutcome::Terminal => self.unchanged += 1,
            ReconcileOutcome::Conflict => self.conflicts += 1,
            ReconcileOutcome::Rejected { .. } => self.rejected += 1,
            ReconcileOutcome::QueryFailed(_) => self.failures += 1,
        }
    }

    fn merge(&mut self, other: SweepReport) {
        self.checked += other.checked;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.conflicts += other.conflicts;
        self.rejected += other.rejected;
        self.failures += other.failures;
    }
}

pub struct Reconciler {
    jobs: Arc<dyn JobStore>,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<TrainerRegistry>,
    settings: ReconcileSettings,
    limits: BTreeMap<Platform, Arc<Semaphore>>,
}

impl Reconciler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<TrainerRegistry>,
        settings: ReconcileSettings,
    ) -> Self {
        let limits = Platform::ALL
            .into_iter()
            .map(|platform| {
                let permits = settings.concurrency.get(&platform).copied().unwrap_or(1).max(1);
                (platform, Arc::new(Semaphore::new(permits)))
            })
            .collect();
        Self {
            jobs,
            credentials,
            registry,
            settings,
            limits,
        }
    }

    /// Query the backend for one job and write the resulting status if the
    /// state machine accepts it.
    pub async fn reconcile_job(&self, job: &TrainingJob) -> ReconcileOutcome {
        if job.status.is_terminal() {
            return ReconcileOutcome::Terminal;
        }
        let Some(handle) = job.external_handle.as_deref() else {
            return ReconcileOutcome::Unchanged;
        };

        let report = match self.query(job, handle).await {
            Ok(report) => report,
            Err(e) => {
                warn!(job_id = %job.id, platform = %job.platform, error = %e, "status query failed, retrying next cycle");
                return ReconcileOutcome::QueryFailed(e.to_string());
            }
        };
        if report.is_unmapped() {
            warn!(
                job_id = %job.id,
                platform = %job.platform,
                native_status = %report.native,
                "backend returned an unmapped status"
            );
        }

        let to = match StateMachine::next(job.status, report.status) {
            Transition::Next(to) => to,
            Transition::Unchanged => return ReconcileOutcome::Unchanged,
            Transition::Terminal => return ReconcileOutcome::Terminal,
            Transition::Rejected { from, to } => {
                warn!(
                    job_id = %job.id,
                    platform = %job.platform,
                    %from,
                    %to,
                    native_status = %report.native,
                    "status transition rejected"
                );
                return ReconcileOutcome::Rejected { from, to };
            }
        };

        let message = (to == JobStatus::Failed).then(|| {
            report
                .message
                .clone()
                .unwrap_or_else(|| format!("backend reported {}", report.native))
        });
        let patch = JobPatch::status(to).with_error(message);

        match self.jobs.update_if_status(&job.id, job.status, patch).await {
            Ok(true) => {
                info!(
                    job_id = %job.id,
                    platform = %job.platform,
                    from = %job.status,
                    status = %to,
                    native_status = %report.native,
                    "job status updated"
                );
                ReconcileOutcome::Updated {
                    from: job.status,
                    to,
                }
            }
            Ok(false) => {
                debug!(job_id = %job.id, expected = %job.status, "job changed concurrently, skipping update");
                ReconcileOutcome::Conflict
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to write job status");
                ReconcileOutcome::QueryFailed(e.to_string())
            }
        }
    }

    async fn query(&self, job: &TrainingJob, handle: &str) -> TrainResult<crate::trainer::StatusReport> {
        let entry = self.registry.resolve(job.platform)?;
        let credential = self.credential_for(job).await?;
        let trainer = entry.build(TrainerContext::from_job(job, credential));

        match timeout(self.settings.query_timeout, trainer.query_status(handle)).await {
            Ok(result) => result,
            Err(_) => Err(TrainError::Timeout {
                operation: "status query",
                after: self.settings.query_timeout,
            }),
        }
    }

    async fn credential_for(&self, job: &TrainingJob) -> TrainResult<Option<Credential>> {
        let Some(id) = job.credential_id.as_deref() else {
            return Ok(None);
        };
        let credential = self.credentials.get(id).await?;
        if credential.is_none() {
            warn!(job_id = %job.id, credential_id = id, "credential is gone, querying without it");
        }
        Ok(credential)
    }

    /// Reconcile every pollable job of one platform, bounded by the
    /// platform's query limit.
    pub async fn sweep_platform(self: &Arc<Self>, platform: Platform) -> TrainResult<SweepReport> {
        let due: Vec<TrainingJob> = self
            .jobs
            .list_nonterminal(Some(platform))
            .await?
            .into_iter()
            .filter(TrainingJob::needs_polling)
            .collect();

        let mut report = SweepReport::default();
        if due.is_empty() {
            return Ok(report);
        }

        let limit = self
            .limits
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(1)));
        let mut running = JoinSet::new();
        for job in due {
            let reconciler = Arc::clone(self);
            let limit = Arc::clone(&limit);
            running.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                reconciler.reconcile_job(&job).await
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(%platform, error = %e, "reconcile task panicked");
                    report.checked += 1;
                    report.failures += 1;
                }
            }
        }
        debug!(
            %platform,
            checked = report.checked,
            updated = report.updated,
            failures = report.failures,
            "sweep finished"
        );
        Ok(report)
    }

    /// One sweep over every registered platform, run side by side.
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let mut sweeps = JoinSet::new();
        for platform in self.registry.platforms() {
            let reconciler = Arc::clone(self);
            sweeps.spawn(async move { (platform, reconciler.sweep_platform(platform).await) });
        }

        let mut total = SweepReport::default();
        while let Some(joined) = sweeps.join_next().await {
            match joined {
                Ok((_, Ok(report))) => total.merge(report),
                Ok((platform, Err(e))) => warn!(%platform, error = %e, "sweep failed"),
                Err(e) => error!(error = %e, "sweep task panicked"),
            }
        }
        total
    }

    /// Start one polling loop per registered platform. The returned handle
    /// finishes once `shutdown` fires and every loop has stopped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut loops = JoinSet::new();
            for platform in self.registry.platforms() {
                let reconciler = Arc::clone(&self);
                let shutdown = shutdown.clone();
                loops.spawn(reconciler.poll_platform(platform, shutdown));
            }
            while let Some(joined) = loops.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "polling loop panicked");
                }
            }
            debug!("reconciliation stopped");
        })
    }

    async fn poll_platform(self: Arc<Self>, platform: Platform, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(%platform, interval_secs = self.settings.interval.as_secs(), "polling started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_platform(platform).await {
                        warn!(%platform, error = %e, "sweep failed");
                    }
                }
            }
        }
    }
}
