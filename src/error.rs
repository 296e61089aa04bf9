use std::time::Duration;

use thiserror::Error;

use crate::state_machine::{JobId, JobStatus, Platform};

pub type TrainResult<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Credential not found: {0}")]
    CredentialNotFound(String),

    #[error("Credential is inactive: {0}")]
    CredentialInactive(String),

    #[error("Credential platform {credential} does not match job platform {job}")]
    PlatformMismatch { credential: Platform, job: Platform },

    #[error("Credential {credential_id} is not owned by {owner}")]
    OwnershipMismatch { credential_id: String, owner: String },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Status query failed: {0}")]
    TransientQuery(String),

    #[error("Cancel request failed: {0}")]
    Cancel(String),

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {id} is already terminal ({status})")]
    AlreadyTerminal { id: JobId, status: JobStatus },

    #[error("Job {id} was already picked up for submission ({status})")]
    AlreadySubmitted { id: JobId, status: JobStatus },

    #[error("Job {0} has no external handle yet")]
    NotYetSubmitted(JobId),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classifies a failure by where it surfaces and whether it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Bad credential, platform or ownership. Rejected synchronously.
    Validation,
    /// Missing backend-specific fields or an unregistered platform.
    Configuration,
    /// Data copy error. Terminal for the job.
    Staging,
    /// Backend rejected job creation. Terminal, never auto-retried.
    Submission,
    /// Status poll error. Retried on the next reconciliation cycle.
    TransientQuery,
    /// Backend refused or failed a cancel request. Returned to the caller.
    Cancel,
    NotFound,
    /// The job is in a state that does not allow the request.
    Conflict,
    Internal,
}

impl FailureKind {
    /// Whether this kind is returned to the caller instead of being recorded
    /// only on the job.
    pub fn is_caller_visible(self) -> bool {
        matches!(
            self,
            FailureKind::Validation
                | FailureKind::Configuration
                | FailureKind::NotFound
                | FailureKind::Conflict
                | FailureKind::Cancel
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Validation => "Validation",
            FailureKind::Configuration => "Configuration",
            FailureKind::Staging => "Staging",
            FailureKind::Submission => "Submission",
            FailureKind::TransientQuery => "TransientQuery",
            FailureKind::Cancel => "Cancel",
            FailureKind::NotFound => "NotFound",
            FailureKind::Conflict => "Conflict",
            FailureKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

impl TrainError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TrainError::CredentialNotFound(_)
            | TrainError::CredentialInactive(_)
            | TrainError::PlatformMismatch { .. }
            | TrainError::OwnershipMismatch { .. } => FailureKind::Validation,
            TrainError::UnsupportedPlatform(_) | TrainError::Configuration(_) => {
                FailureKind::Configuration
            }
            TrainError::Staging(_) => FailureKind::Staging,
            TrainError::Submission(_) => FailureKind::Submission,
            TrainError::TransientQuery(_) | TrainError::Timeout { .. } => FailureKind::TransientQuery,
            TrainError::Cancel(_) => FailureKind::Cancel,
            TrainError::JobNotFound(_) => FailureKind::NotFound,
            TrainError::AlreadyTerminal { .. }
            | TrainError::AlreadySubmitted { .. }
            | TrainError::NotYetSubmitted(_) => FailureKind::Conflict,
            TrainError::Store(_)
            | TrainError::Config(_)
            | TrainError::Io(_)
            | TrainError::Json(_)
            | TrainError::Toml(_) => FailureKind::Internal,
        }
    }
}
