use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::coordinator::SubmissionCoordinator;
use crate::error::{TrainError, TrainResult};
use crate::state_machine::{JobDescription, JobId, JobPatch, JobStatus, JobView};
use crate::store::{CredentialStore, JobFilter, JobStore, Page};
use crate::trainer::{TrainerContext, TrainerRegistry};

/// Result of an accepted cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CancelAck {
    /// The backend cancel call went out and the job moved to `CANCELLING`.
    Accepted,
    /// The job was already `CANCELLING`; nothing was sent.
    AlreadyCancelling,
}

/// Caller-facing operations over training jobs.
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<TrainerRegistry>,
    coordinator: Arc<SubmissionCoordinator>,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<TrainerRegistry>,
        coordinator: Arc<SubmissionCoordinator>,
    ) -> Self {
        Self {
            jobs,
            credentials,
            registry,
            coordinator,
        }
    }

    /// Accept a job. Staging and submission continue in the background; the
    /// caller follows progress through [`get_job`](Self::get_job).
    pub async fn submit_job(&self, description: JobDescription) -> TrainResult<JobId> {
        let job = self.coordinator.submit_job(description).await?;
        Ok(job.id)
    }

    pub async fn get_job(&self, id: &JobId) -> TrainResult<JobView> {
        self.jobs
            .get(id)
            .await?
            .map(|job| JobView::from_job(&job))
            .ok_or_else(|| TrainError::JobNotFound(id.clone()))
    }

    /// Jobs of `owner`, newest first.
    pub async fn list_jobs(
        &self,
        owner: &str,
        status: Option<JobStatus>,
        page: Page,
    ) -> TrainResult<Vec<JobView>> {
        let filter = JobFilter {
            owner: Some(owner.to_string()),
            status,
            page,
        };
        let jobs = self.jobs.list(&filter).await?;
        Ok(jobs.iter().map(JobView::from_job).collect())
    }

    /// Ask the backend to stop a job and mark it `CANCELLING`. The final
    /// `CANCELLED` comes from a later status query.
    pub async fn cancel_job(&self, id: &JobId) -> TrainResult<CancelAck> {
        let job = self
            .jobs
            .get(id)
            .await?
            .ok_or_else(|| TrainError::JobNotFound(id.clone()))?;

        if job.status.is_terminal() {
            return Err(TrainError::AlreadyTerminal {
                id: job.id,
                status: job.status,
            });
        }
        if job.status == JobStatus::Cancelling {
            debug!(job_id = %job.id, "cancel already in progress");
            return Ok(CancelAck::AlreadyCancelling);
        }
        let Some(handle) = job.external_handle.clone() else {
            return Err(TrainError::NotYetSubmitted(job.id));
        };

        let entry = self.registry.resolve(job.platform)?;
        let credential = match job.credential_id.as_deref() {
            Some(credential_id) => self.credentials.get(credential_id).await?,
            None => None,
        };
        let trainer = entry.build(TrainerContext::from_job(&job, credential));
        trainer.cancel(&handle).await?;

        let applied = self
            .jobs
            .update_if_status(&job.id, job.status, JobPatch::status(JobStatus::Cancelling))
            .await?;
        if applied {
            info!(job_id = %job.id, platform = %job.platform, from = %job.status, "cancel requested");
        } else {
            warn!(job_id = %job.id, "job changed while cancelling, status left to the next poll");
        }
        Ok(CancelAck::Accepted)
    }
}
