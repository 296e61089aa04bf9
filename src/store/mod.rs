//! Boundaries to the record stores that persist jobs and credentials.
//!
//! The real stores live outside this crate. [`MemoryJobStore`] and
//! [`MemoryCredentialStore`] back the CLI and the tests.

mod memory;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::TrainResult;
use crate::state_machine::{JobId, JobPatch, JobStatus, Platform, TrainingJob};

pub use memory::{MemoryCredentialStore, MemoryJobStore};

/// Pagination window for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Filter for caller-facing job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub status: Option<JobStatus>,
    pub page: Page,
}

impl JobFilter {
    pub fn matches(&self, job: &TrainingJob) -> bool {
        self.owner.as_deref().is_none_or(|owner| job.owner == owner)
            && self.status.is_none_or(|status| job.status == status)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: TrainingJob) -> TrainResult<JobId>;

    async fn get(&self, id: &JobId) -> TrainResult<Option<TrainingJob>>;

    /// Apply `patch` only if the stored status still equals `expected`.
    /// Returns `false` on a mismatch or when the job does not exist.
    async fn update_if_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        patch: JobPatch,
    ) -> TrainResult<bool>;

    async fn list_nonterminal(&self, platform: Option<Platform>) -> TrainResult<Vec<TrainingJob>>;

    /// Newest first, windowed by `filter.page`.
    async fn list(&self, filter: &JobFilter) -> TrainResult<Vec<TrainingJob>>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, id: &str) -> TrainResult<Option<Credential>>;
}
