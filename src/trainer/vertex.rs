//! Vertex AI custom jobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    BackendClient, StatusReport, Submission, Trainer, TrainerContext, check_script_config,
};
use crate::error::{TrainError, TrainResult};
use crate::staging::{DataStager, StagedChannels};
use crate::state_machine::{JobStatus, Platform};

pub const REQUIRED_KEYS: &[&str] = &["project", "region", "image_uri", "machine_type"];

pub const TOKEN_SECRET: &str = "token";

/// Native `JobState` to canonical status.
pub fn map_native_status(native: &str) -> JobStatus {
    match native {
        "JOB_STATE_QUEUED" | "JOB_STATE_PAUSED" => JobStatus::Queued,
        "JOB_STATE_PENDING" => JobStatus::Initializing,
        "JOB_STATE_RUNNING" => JobStatus::Running,
        "JOB_STATE_UPDATING" => JobStatus::UpdatingMetrics,
        "JOB_STATE_SUCCEEDED" | "JOB_STATE_PARTIALLY_SUCCEEDED" => JobStatus::Completed,
        "JOB_STATE_FAILED" | "JOB_STATE_EXPIRED" => JobStatus::Failed,
        "JOB_STATE_CANCELLING" => JobStatus::Cancelling,
        "JOB_STATE_CANCELLED" => JobStatus::Cancelled,
        _ => JobStatus::Unknown,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CustomJob {
    display_name: String,
    job_spec: JobSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSpec {
    worker_pool_specs: Vec<WorkerPoolSpec>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerPoolSpec {
    machine_spec: MachineSpec,
    replica_count: u64,
    container_spec: ContainerSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MachineSpec {
    machine_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerSpec {
    image_uri: String,
    args: Vec<String>,
    env: Vec<EnvVar>,
}

#[derive(Debug, Serialize)]
struct EnvVar {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct CustomJobResource {
    name: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<RpcStatus>,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    message: String,
}

pub struct VertexTrainer {
    ctx: TrainerContext,
    client: BackendClient,
    stager: DataStager,
}

impl VertexTrainer {
    pub fn new(ctx: TrainerContext, http: reqwest::Client, base_url: &str) -> Self {
        let token = ctx.secret(TOKEN_SECRET).map(str::to_string);
        let stager = DataStager::for_storage(ctx.storage, &http);
        Self {
            client: BackendClient::new(http, base_url, token),
            stager,
            ctx,
        }
    }

    fn custom_job(&self, staged: &StagedChannels) -> CustomJob {
        let args = self
            .ctx
            .hyperparameter_strings()
            .into_iter()
            .map(|(k, v)| format!("--{k}={v}"))
            .collect();
        let env = staged
            .iter()
            .map(|(name, path)| EnvVar {
                name: format!("CHANNEL_{}", name.to_ascii_uppercase()),
                value: path.display().to_string(),
            })
            .collect();

        CustomJob {
            display_name: format!("trainyard-{}", self.ctx.job_id),
            job_spec: JobSpec {
                worker_pool_specs: vec![WorkerPoolSpec {
                    machine_spec: MachineSpec {
                        machine_type: self.ctx.script_value("machine_type").unwrap_or_default(),
                    },
                    replica_count: self.ctx.script_u64("replica_count", 1),
                    container_spec: ContainerSpec {
                        image_uri: self.ctx.script_value("image_uri").unwrap_or_default(),
                        args,
                        env,
                    },
                }],
            },
        }
    }
}

#[async_trait]
impl Trainer for VertexTrainer {
    fn platform(&self) -> Platform {
        Platform::Vertex
    }

    fn context(&self) -> &TrainerContext {
        &self.ctx
    }

    fn stager(&self) -> &DataStager {
        &self.stager
    }

    async fn submit(&self, staged: &StagedChannels) -> TrainResult<Submission> {
        check_script_config(Platform::Vertex, &self.ctx.script_config, REQUIRED_KEYS)?;
        let project = self.ctx.script_value("project").unwrap_or_default();
        let region = self.ctx.script_value("region").unwrap_or_default();
        let path = format!("/v1/projects/{project}/locations/{region}/customJobs");

        let created: CustomJobResource = self
            .client
            .post_json(&path, &[], &self.custom_job(staged))
            .await
            .map_err(|e| TrainError::Submission(format!("create custom job: {e}")))?;

        let status = match created.state.as_deref().map(map_native_status) {
            Some(JobStatus::Queued) => JobStatus::Queued,
            _ => JobStatus::Submitted,
        };
        info!(job_id = %self.ctx.job_id, name = %created.name, %status, "custom job created");
        Ok(Submission {
            handle: created.name,
            status,
        })
    }

    async fn query_status(&self, handle: &str) -> TrainResult<StatusReport> {
        let job: CustomJobResource = self
            .client
            .get_json(&format!("/v1/{handle}"))
            .await
            .map_err(|e| TrainError::TransientQuery(format!("get {handle}: {e}")))?;

        let native = job.state.unwrap_or_default();
        Ok(StatusReport::new(map_native_status(&native), native)
            .with_message(job.error.map(|e| e.message)))
    }

    async fn cancel(&self, handle: &str) -> TrainResult<()> {
        let _: serde_json::Value = self
            .client
            .post_json(&format!("/v1/{handle}:cancel"), &[], &serde_json::json!({}))
            .await
            .map_err(|e| TrainError::Cancel(format!("cancel {handle}: {e}")))?;
        info!(job_id = %self.ctx.job_id, name = handle, "cancel requested");
        Ok(())
    }
}
