use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobStatus;
use crate::error::TrainError;
use crate::staging::StorageKind;

/// Opaque key/value mapping handed through to a backend untouched.
pub type Params = BTreeMap<String, serde_json::Value>;

/// The external training backend a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    HuggingFace,
    SageMaker,
    Vertex,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::HuggingFace, Platform::SageMaker, Platform::Vertex];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::HuggingFace => "huggingface",
            Platform::SageMaker => "sagemaker",
            Platform::Vertex => "vertex",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| TrainError::UnsupportedPlatform(s.to_string()))
    }
}

/// Internal identifier for a training job, generated at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub platform: Platform,
    /// Wallet or account identifier of the requesting principal.
    pub owner: String,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub storage: StorageKind,
    /// Channel name to source URI.
    #[serde(default)]
    pub channels: BTreeMap<String, String>,
    #[serde(default)]
    pub hyperparameters: Params,
    #[serde(default)]
    pub script_config: Params,
    /// Defaults to `<work_root>/<job_id>` when absent.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

impl JobDescription {
    pub fn new(platform: Platform, owner: impl Into<String>) -> Self {
        Self {
            platform,
            owner: owner.into(),
            credential_id: None,
            storage: StorageKind::default(),
            channels: BTreeMap::new(),
            hyperparameters: Params::new(),
            script_config: Params::new(),
            work_dir: None,
        }
    }
}

/// A training job as persisted in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: JobId,
    /// Backend-assigned identifier, set once submission succeeds.
    pub external_handle: Option<String>,
    pub platform: Platform,
    pub owner: String,
    pub credential_id: Option<String>,
    pub storage: StorageKind,
    pub channels: BTreeMap<String, String>,
    pub work_dir: PathBuf,
    pub hyperparameters: Params,
    pub script_config: Params,
    pub status: JobStatus,
    pub status_history: Vec<JobStatus>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingJob {
    /// Create a `Pending` job from a description. The working directory
    /// defaults to a per-job directory under `work_root`.
    pub fn new(description: JobDescription, work_root: &Path) -> Self {
        let id = JobId::new();
        let now = Utc::now();
        let work_dir = description
            .work_dir
            .unwrap_or_else(|| work_root.join(id.as_str()));
        Self {
            id,
            external_handle: None,
            platform: description.platform,
            owner: description.owner,
            credential_id: description.credential_id,
            storage: description.storage,
            channels: description.channels,
            work_dir,
            hyperparameters: description.hyperparameters,
            script_config: description.script_config,
            status: JobStatus::Pending,
            status_history: vec![JobStatus::Pending],
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a patch written by the coordinator or the reconciler.
    pub fn apply(&mut self, patch: JobPatch) {
        if patch.status != self.status {
            self.status_history.push(patch.status);
        }
        self.status = patch.status;
        if let Some(handle) = patch.external_handle {
            self.external_handle = Some(handle);
        }
        if let Some(message) = patch.last_error {
            self.last_error = Some(message);
        }
        self.updated_at = Utc::now();
    }

    /// Whether the reconciliation loop should poll this job.
    pub fn needs_polling(&self) -> bool {
        !self.status.is_terminal() && self.external_handle.is_some()
    }
}

/// A status change plus the fields that travel with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPatch {
    pub status: JobStatus,
    pub external_handle: Option<String>,
    pub last_error: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            external_handle: None,
            last_error: None,
        }
    }

    pub fn submitted(status: JobStatus, handle: String) -> Self {
        Self {
            status,
            external_handle: Some(handle),
            last_error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            external_handle: None,
            last_error: Some(message.into()),
        }
    }

    pub fn with_error(mut self, message: Option<String>) -> Self {
        self.last_error = message;
        self
    }
}

/// Caller-facing projection of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub platform: Platform,
    pub owner: String,
    pub status: JobStatus,
    pub external_handle: Option<String>,
    pub last_error: Option<String>,
    pub status_history: Vec<JobStatus>,
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobView {
    pub fn from_job(job: &TrainingJob) -> Self {
        Self {
            job_id: job.id.clone(),
            platform: job.platform,
            owner: job.owner.clone(),
            status: job.status,
            external_handle: job.external_handle.clone(),
            last_error: job.last_error.clone(),
            status_history: job.status_history.clone(),
            work_dir: job.work_dir.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> JobDescription {
        let mut desc = JobDescription::new(Platform::SageMaker, "0xowner");
        desc.channels
            .insert("training".into(), "file:///data/train".into());
        desc
    }

    #[test]
    fn job_creation_defaults() {
        let job = TrainingJob::new(description(), Path::new("/tmp/work"));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.status_history, vec![JobStatus::Pending]);
        assert!(job.external_handle.is_none());
        assert!(job.last_error.is_none());
        assert_eq!(job.work_dir, Path::new("/tmp/work").join(job.id.as_str()));
        assert!(!job.needs_polling());
    }

    #[test]
    fn explicit_work_dir_is_kept() {
        let mut desc = description();
        desc.work_dir = Some(PathBuf::from("/scratch/job"));
        let job = TrainingJob::new(desc, Path::new("/tmp/work"));
        assert_eq!(job.work_dir, PathBuf::from("/scratch/job"));
    }

    #[test]
    fn apply_records_history_and_handle() {
        let mut job = TrainingJob::new(description(), Path::new("/tmp/work"));
        job.apply(JobPatch::status(JobStatus::PreparingData));
        job.apply(JobPatch::submitted(JobStatus::Submitted, "arn:job/1".into()));

        assert_eq!(job.external_handle.as_deref(), Some("arn:job/1"));
        assert_eq!(
            job.status_history,
            vec![
                JobStatus::Pending,
                JobStatus::PreparingData,
                JobStatus::Submitted
            ]
        );
        assert!(job.needs_polling());
    }

    #[test]
    fn terminal_jobs_are_not_polled() {
        let mut job = TrainingJob::new(description(), Path::new("/tmp/work"));
        job.apply(JobPatch::submitted(JobStatus::Submitted, "h".into()));
        job.apply(JobPatch::failed("boom"));
        assert!(!job.needs_polling());
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn platform_parse() {
        assert_eq!("SageMaker".parse::<Platform>().unwrap(), Platform::SageMaker);
        assert_eq!(
            "huggingface".parse::<Platform>().unwrap(),
            Platform::HuggingFace
        );
        let err = "azure".parse::<Platform>().unwrap_err();
        assert!(matches!(err, TrainError::UnsupportedPlatform(ref p) if p == "azure"));
    }

    #[test]
    fn description_deserializes_with_defaults() {
        let desc: JobDescription = serde_json::from_str(
            r#"{"platform": "vertex", "owner": "acct-1", "channels": {"training": "/d"}}"#,
        )
        .unwrap();
        assert_eq!(desc.platform, Platform::Vertex);
        assert_eq!(desc.storage, StorageKind::Local);
        assert!(desc.credential_id.is_none());
        assert!(desc.hyperparameters.is_empty());
    }

    #[test]
    fn view_hides_credential_reference() {
        let mut desc = description();
        desc.credential_id = Some("cred-9".into());
        let job = TrainingJob::new(desc, Path::new("/tmp/work"));
        let json = serde_json::to_string(&JobView::from_job(&job)).unwrap();
        assert!(!json.contains("cred-9"));
        assert!(json.contains(r#""status":"PENDING""#));
    }
}
