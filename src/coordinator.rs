use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::credentials::{Credential, CredentialValidator};
use crate::error::{TrainError, TrainResult};
use crate::state_machine::{JobDescription, JobId, JobPatch, JobStatus, TrainingJob};
use crate::store::{CredentialStore, JobStore};
use crate::trainer::{TrainerContext, TrainerRegistry, check_script_config};

/// Work item for the submission workers: a job that passed validation,
/// together with the credential it was validated against.
#[derive(Debug, Clone)]
pub struct SubmissionTask {
    pub job_id: JobId,
    pub credential: Option<Credential>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub work_root: PathBuf,
    pub stage_timeout: Duration,
    pub submit_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_root: config.work_root.clone(),
            stage_timeout: config.stage_timeout(),
            submit_timeout: config.submit_timeout(),
        }
    }
}

/// Drives a job from `PENDING` to its first backend status.
///
/// Validation runs on the caller's request; staging and the external
/// creation call run later on a submission worker.
pub struct SubmissionCoordinator {
    jobs: Arc<dyn JobStore>,
    validator: CredentialValidator,
    registry: Arc<TrainerRegistry>,
    settings: CoordinatorSettings,
    queue: mpsc::Sender<SubmissionTask>,
}

impl SubmissionCoordinator {
    /// Create the coordinator and the receiving end of its work queue.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<TrainerRegistry>,
        settings: CoordinatorSettings,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<SubmissionTask>) {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let coordinator = Self {
            jobs,
            validator: CredentialValidator::new(credentials),
            registry,
            settings,
            queue,
        };
        (Arc::new(coordinator), rx)
    }

    /// Record a new job and validate it. On success the job is queued for
    /// staging and submission and returned while still `PENDING`.
    ///
    /// A bad credential or missing backend configuration fails the job and
    /// is returned to the caller here, before any staging happens.
    pub async fn submit_job(&self, description: JobDescription) -> TrainResult<TrainingJob> {
        let job = TrainingJob::new(description, &self.settings.work_root);
        self.jobs.create(job.clone()).await?;
        info!(job_id = %job.id, platform = %job.platform, owner = %job.owner, "job created");

        let credential = match &job.credential_id {
            Some(credential_id) => {
                match self
                    .validator
                    .validate(credential_id, job.platform, &job.owner)
                    .await
                {
                    Ok(credential) => Some(credential),
                    Err(e) => return Err(self.reject(&job, e).await),
                }
            }
            None => None,
        };

        if let Err(e) = self.check_configuration(&job) {
            return Err(self.reject(&job, e).await);
        }

        let task = SubmissionTask {
            job_id: job.id.clone(),
            credential,
        };
        if self.queue.send(task).await.is_err() {
            let e = TrainError::Submission("submission queue is closed".to_string());
            return Err(self.reject(&job, e).await);
        }
        debug!(job_id = %job.id, "job queued for submission");
        Ok(job)
    }

    fn check_configuration(&self, job: &TrainingJob) -> TrainResult<()> {
        let entry = self.registry.resolve(job.platform)?;
        check_script_config(job.platform, &job.script_config, entry.required_keys)
    }

    async fn reject(&self, job: &TrainingJob, err: TrainError) -> TrainError {
        warn!(job_id = %job.id, kind = %err.kind(), error = %err, "job rejected");
        if let Err(store_err) = self
            .jobs
            .update_if_status(&job.id, JobStatus::Pending, JobPatch::failed(err.to_string()))
            .await
        {
            error!(job_id = %job.id, error = %store_err, "failed to record rejection");
        }
        err
    }

    /// Stage and submit one job. The external creation call is issued at most
    /// once per job: the job is claimed by moving it out of `PENDING`, and a
    /// job that is no longer `PENDING` is rejected instead of re-run.
    pub async fn process(&self, task: SubmissionTask) -> TrainResult<TrainingJob> {
        let job = self
            .jobs
            .get(&task.job_id)
            .await?
            .ok_or_else(|| TrainError::JobNotFound(task.job_id.clone()))?;

        let claimed = self
            .jobs
            .update_if_status(&job.id, JobStatus::Pending, JobPatch::status(JobStatus::PreparingData))
            .await?;
        if !claimed {
            let status = self.current_status(&job.id).await.unwrap_or(job.status);
            debug!(job_id = %job.id, %status, "job already past PENDING, not resubmitting");
            return Err(if status.is_terminal() {
                TrainError::AlreadyTerminal { id: job.id, status }
            } else {
                TrainError::AlreadySubmitted { id: job.id, status }
            });
        }
        info!(job_id = %job.id, platform = %job.platform, "preparing data");

        let entry = match self.registry.resolve(job.platform) {
            Ok(entry) => entry,
            Err(e) => return Err(self.fail(&job.id, JobStatus::PreparingData, e).await),
        };
        let trainer = entry.build(TrainerContext::from_job(&job, task.credential));

        let staged = match timeout(self.settings.stage_timeout, trainer.stage(&job.channels)).await {
            Ok(Ok(staged)) => staged,
            Ok(Err(e)) => return Err(self.fail(&job.id, JobStatus::PreparingData, e).await),
            Err(_) => {
                let e = TrainError::Staging(format!(
                    "timed out after {:?}",
                    self.settings.stage_timeout
                ));
                return Err(self.fail(&job.id, JobStatus::PreparingData, e).await);
            }
        };

        let submission = match timeout(self.settings.submit_timeout, trainer.submit(&staged)).await {
            Ok(Ok(submission)) => submission,
            Ok(Err(e)) => return Err(self.fail(&job.id, JobStatus::PreparingData, e).await),
            Err(_) => {
                let e = TrainError::Submission(format!(
                    "timed out after {:?}",
                    self.settings.submit_timeout
                ));
                return Err(self.fail(&job.id, JobStatus::PreparingData, e).await);
            }
        };

        let status = match submission.status {
            JobStatus::Queued => JobStatus::Queued,
            _ => JobStatus::Submitted,
        };
        let applied = self
            .jobs
            .update_if_status(
                &job.id,
                JobStatus::PreparingData,
                JobPatch::submitted(status, submission.handle.clone()),
            )
            .await?;
        if applied {
            info!(job_id = %job.id, handle = %submission.handle, %status, "job submitted");
        } else {
            warn!(job_id = %job.id, handle = %submission.handle, "job changed while submitting, handle not recorded");
        }

        self.jobs
            .get(&job.id)
            .await?
            .ok_or(TrainError::JobNotFound(job.id))
    }

    /// Fail a queued job that will never reach a worker.
    pub async fn abandon(&self, task: SubmissionTask) {
        let e = TrainError::Submission("shut down before submission".to_string());
        match self
            .jobs
            .update_if_status(&task.job_id, JobStatus::Pending, JobPatch::failed(e.to_string()))
            .await
        {
            Ok(true) => warn!(job_id = %task.job_id, "queued job failed at shutdown"),
            Ok(false) => debug!(job_id = %task.job_id, "queued job already left PENDING"),
            Err(store_err) => error!(job_id = %task.job_id, error = %store_err, "failed to record abandoned job"),
        }
    }

    async fn current_status(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs.get(id).await.ok().flatten().map(|job| job.status)
    }

    async fn fail(&self, id: &JobId, from: JobStatus, err: TrainError) -> TrainError {
        warn!(job_id = %id, kind = %err.kind(), error = %err, "job failed");
        match self
            .jobs
            .update_if_status(id, from, JobPatch::failed(err.to_string()))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %id, "job changed before failure could be recorded"),
            Err(store_err) => error!(job_id = %id, error = %store_err, "failed to record failure"),
        }
        err
    }
}

/// Drain the submission queue, running up to `workers` jobs at a time,
/// until the queue closes or `shutdown` fires. Jobs still queued at shutdown
/// are failed; jobs already on a worker run to completion.
pub fn spawn_submission_workers(
    coordinator: Arc<SubmissionCoordinator>,
    mut queue: mpsc::Receiver<SubmissionTask>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                task = queue.recv() => {
                    let Some(task) = task else { break };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                    let coordinator = Arc::clone(&coordinator);
                    running.spawn(async move {
                        let _permit = permit;
                        let job_id = task.job_id.clone();
                        if let Err(e) = coordinator.process(task).await {
                            debug!(job_id = %job_id, kind = %e.kind(), error = %e, "submission ended without a handle");
                        }
                    });
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "submission task panicked");
                    }
                }
            }
        }

        queue.close();
        while let Some(task) = queue.recv().await {
            coordinator.abandon(task).await;
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "submission task panicked");
            }
        }
        debug!("submission workers stopped");
    })
}
