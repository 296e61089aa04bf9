//! Training backends.
//!
//! A [`Trainer`] adapts one external platform to the canonical job model.
//! Instances are built per operation from a [`TrainerContext`] and hold no
//! state between calls; the [`TrainerRegistry`] maps each platform to the
//! constructor for its variant.

pub mod client;
pub mod huggingface;
pub mod registry;
pub mod sagemaker;
pub mod vertex;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::{TrainError, TrainResult};
use crate::staging::{DataStager, StagedChannels, StorageKind};
use crate::state_machine::{JobId, JobStatus, Params, Platform, TrainingJob};

pub use client::{BackendClient, BackendError};
pub use huggingface::HuggingFaceTrainer;
pub use registry::{TrainerEntry, TrainerFactory, TrainerRegistry};
pub use sagemaker::SageMakerTrainer;
pub use vertex::VertexTrainer;

/// Credential secret holding the bearer token for HTTP storage sources.
pub const STORAGE_TOKEN_SECRET: &str = "storage_token";

/// Job attributes a trainer needs for one operation.
#[derive(Debug, Clone)]
pub struct TrainerContext {
    pub job_id: JobId,
    pub external_handle: Option<String>,
    pub storage: StorageKind,
    pub credential: Option<Credential>,
    pub work_dir: PathBuf,
    pub hyperparameters: Params,
    pub script_config: Params,
}

impl TrainerContext {
    pub fn from_job(job: &TrainingJob, credential: Option<Credential>) -> Self {
        Self {
            job_id: job.id.clone(),
            external_handle: job.external_handle.clone(),
            storage: job.storage,
            credential,
            work_dir: job.work_dir.clone(),
            hyperparameters: job.hyperparameters.clone(),
            script_config: job.script_config.clone(),
        }
    }

    pub fn secret(&self, key: &str) -> Option<&str> {
        self.credential.as_ref().and_then(|c| c.secret(key))
    }

    /// A script-configuration value rendered as a plain string.
    pub fn script_value(&self, key: &str) -> Option<String> {
        self.script_config.get(key).and_then(param_to_string)
    }

    pub fn script_u64(&self, key: &str, default: u64) -> u64 {
        match self.script_config.get(key) {
            Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Hyperparameters with every value rendered as a string.
    pub fn hyperparameter_strings(&self) -> BTreeMap<String, String> {
        self.hyperparameters
            .iter()
            .filter_map(|(k, v)| param_to_string(v).map(|s| (k.clone(), s)))
            .collect()
    }
}

fn param_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Fails with a configuration error naming every required key that is absent.
pub fn check_script_config(platform: Platform, script_config: &Params, required: &[&str]) -> TrainResult<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|key| script_config.get(*key).and_then(param_to_string).is_none())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TrainError::Configuration(format!(
            "{platform} script_config is missing {}",
            missing.join(", ")
        )))
    }
}

/// Result of a successful external creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub handle: String,
    pub status: JobStatus,
}

/// A backend status mapped onto the canonical vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: JobStatus,
    /// The value the backend returned, kept for logs.
    pub native: String,
    /// Failure reason reported alongside the status, if any.
    pub message: Option<String>,
}

impl StatusReport {
    pub fn new(status: JobStatus, native: impl Into<String>) -> Self {
        Self {
            status,
            native: native.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn is_unmapped(&self) -> bool {
        self.status == JobStatus::Unknown
    }
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn platform(&self) -> Platform;

    fn context(&self) -> &TrainerContext;

    fn stager(&self) -> &DataStager;

    /// Copy every channel into `work_dir/input/<channel>`. Safe to re-run
    /// after a partial failure.
    async fn stage(&self, channels: &BTreeMap<String, String>) -> TrainResult<StagedChannels> {
        let ctx = self.context();
        self.stager()
            .stage(&ctx.work_dir, channels, ctx.secret(STORAGE_TOKEN_SECRET))
            .await
    }

    /// Issue exactly one external creation call. Never retried here.
    async fn submit(&self, staged: &StagedChannels) -> TrainResult<Submission>;

    /// Describe the job and map the native status. Unmapped values come
    /// back as `Unknown`, never as an error.
    async fn query_status(&self, handle: &str) -> TrainResult<StatusReport>;

    /// Best-effort stop request. Does not change the canonical status.
    async fn cancel(&self, handle: &str) -> TrainResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn check_script_config_lists_missing_keys() {
        let config = params(&[("image_uri", json!("img")), ("region", json!(""))]);
        let err = check_script_config(Platform::Vertex, &config, &["image_uri", "region", "project"])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: vertex script_config is missing region, project"
        );
        assert!(check_script_config(Platform::Vertex, &config, &["image_uri"]).is_ok());
    }

    #[test]
    fn hyperparameters_render_as_strings() {
        let job = TrainingJob::new(
            {
                let mut d = crate::state_machine::JobDescription::new(Platform::SageMaker, "o");
                d.hyperparameters = params(&[
                    ("epochs", json!(3)),
                    ("lr", json!(0.001)),
                    ("optimizer", json!("adamw")),
                    ("skip", json!(null)),
                ]);
                d
            },
            std::path::Path::new("/tmp"),
        );
        let ctx = TrainerContext::from_job(&job, None);
        let rendered = ctx.hyperparameter_strings();
        assert_eq!(rendered["epochs"], "3");
        assert_eq!(rendered["lr"], "0.001");
        assert_eq!(rendered["optimizer"], "adamw");
        assert!(!rendered.contains_key("skip"));
    }

    #[test]
    fn script_u64_accepts_numbers_and_strings() {
        let job = TrainingJob::new(
            {
                let mut d = crate::state_machine::JobDescription::new(Platform::SageMaker, "o");
                d.script_config = params(&[("a", json!(2)), ("b", json!("5")), ("c", json!("x"))]);
                d
            },
            std::path::Path::new("/tmp"),
        );
        let ctx = TrainerContext::from_job(&job, None);
        assert_eq!(ctx.script_u64("a", 1), 2);
        assert_eq!(ctx.script_u64("b", 1), 5);
        assert_eq!(ctx.script_u64("c", 1), 1);
        assert_eq!(ctx.script_u64("missing", 9), 9);
    }
}
