//! SageMaker training jobs over the JSON (`X-Amz-Target`) protocol.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    BackendClient, StatusReport, Submission, Trainer, TrainerContext, check_script_config,
};
use crate::error::{TrainError, TrainResult};
use crate::staging::{DataStager, StagedChannels};
use crate::state_machine::{JobStatus, Platform};

pub const REQUIRED_KEYS: &[&str] = &["image_uri", "instance_type"];

pub const ROLE_SECRET: &str = "role_arn";
pub const TOKEN_SECRET: &str = "token";

const TARGET_CREATE: &str = "SageMaker.CreateTrainingJob";
const TARGET_DESCRIBE: &str = "SageMaker.DescribeTrainingJob";
const TARGET_STOP: &str = "SageMaker.StopTrainingJob";

/// Native `TrainingJobStatus` to canonical status.
pub fn map_native_status(native: &str) -> JobStatus {
    match native {
        "InProgress" => JobStatus::Running,
        "Completed" => JobStatus::Completed,
        "Failed" => JobStatus::Failed,
        "Stopping" => JobStatus::Cancelling,
        "Stopped" => JobStatus::Cancelled,
        _ => JobStatus::Unknown,
    }
}

/// Training job names are derived from the job id so they stay unique.
pub fn training_job_name(ctx: &TrainerContext) -> String {
    format!("trainyard-{}", ctx.job_id)
}

/// `arn:aws:sagemaker:<region>:<account>:training-job/<name>` to `<name>`.
fn name_from_handle(handle: &str) -> &str {
    handle.rsplit('/').next().unwrap_or(handle)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateTrainingJobRequest {
    training_job_name: String,
    role_arn: String,
    algorithm_specification: AlgorithmSpecification,
    hyper_parameters: BTreeMap<String, String>,
    input_data_config: Vec<Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_data_config: Option<OutputDataConfig>,
    resource_config: ResourceConfig,
    stopping_condition: StoppingCondition,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AlgorithmSpecification {
    training_image: String,
    training_input_mode: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Channel {
    channel_name: String,
    data_source: DataSource,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DataSource {
    local_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct OutputDataConfig {
    s3_output_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceConfig {
    instance_type: String,
    instance_count: u64,
    #[serde(rename = "VolumeSizeInGB")]
    volume_size_in_gb: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StoppingCondition {
    max_runtime_in_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateTrainingJobResponse {
    training_job_arn: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TrainingJobRef<'a> {
    training_job_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTrainingJobResponse {
    training_job_status: String,
    #[serde(default)]
    failure_reason: Option<String>,
}

pub struct SageMakerTrainer {
    ctx: TrainerContext,
    client: BackendClient,
    stager: DataStager,
}

impl SageMakerTrainer {
    pub fn new(ctx: TrainerContext, http: reqwest::Client, base_url: &str) -> Self {
        let token = ctx.secret(TOKEN_SECRET).map(str::to_string);
        let stager = DataStager::for_storage(ctx.storage, &http);
        Self {
            client: BackendClient::new(http, base_url, token),
            stager,
            ctx,
        }
    }

    fn create_request(&self, staged: &StagedChannels) -> TrainResult<CreateTrainingJobRequest> {
        check_script_config(Platform::SageMaker, &self.ctx.script_config, REQUIRED_KEYS)?;
        let role_arn = self
            .ctx
            .secret(ROLE_SECRET)
            .ok_or_else(|| {
                TrainError::Configuration(format!("sagemaker credential is missing {ROLE_SECRET}"))
            })?
            .to_string();

        Ok(CreateTrainingJobRequest {
            training_job_name: training_job_name(&self.ctx),
            role_arn,
            algorithm_specification: AlgorithmSpecification {
                training_image: self.ctx.script_value("image_uri").unwrap_or_default(),
                training_input_mode: "File",
            },
            hyper_parameters: self.ctx.hyperparameter_strings(),
            input_data_config: staged
                .iter()
                .map(|(name, path)| Channel {
                    channel_name: name.clone(),
                    data_source: DataSource {
                        local_path: path.display().to_string(),
                    },
                })
                .collect(),
            output_data_config: self
                .ctx
                .script_value("output_path")
                .map(|s3_output_path| OutputDataConfig { s3_output_path }),
            resource_config: ResourceConfig {
                instance_type: self.ctx.script_value("instance_type").unwrap_or_default(),
                instance_count: self.ctx.script_u64("instance_count", 1),
                volume_size_in_gb: self.ctx.script_u64("volume_size_gb", 30),
            },
            stopping_condition: StoppingCondition {
                max_runtime_in_seconds: self.ctx.script_u64("max_runtime_secs", 86_400),
            },
        })
    }
}

#[async_trait]
impl Trainer for SageMakerTrainer {
    fn platform(&self) -> Platform {
        Platform::SageMaker
    }

    fn context(&self) -> &TrainerContext {
        &self.ctx
    }

    fn stager(&self) -> &DataStager {
        &self.stager
    }

    async fn submit(&self, staged: &StagedChannels) -> TrainResult<Submission> {
        let request = self.create_request(staged)?;
        let response: CreateTrainingJobResponse = self
            .client
            .post_json("/", &[("X-Amz-Target", TARGET_CREATE)], &request)
            .await
            .map_err(|e| {
                TrainError::Submission(format!("CreateTrainingJob {}: {e}", request.training_job_name))
            })?;

        info!(job_id = %self.ctx.job_id, arn = %response.training_job_arn, "training job created");
        Ok(Submission {
            handle: response.training_job_arn,
            status: JobStatus::Submitted,
        })
    }

    async fn query_status(&self, handle: &str) -> TrainResult<StatusReport> {
        let request = TrainingJobRef {
            training_job_name: name_from_handle(handle),
        };
        let response: DescribeTrainingJobResponse = self
            .client
            .post_json("/", &[("X-Amz-Target", TARGET_DESCRIBE)], &request)
            .await
            .map_err(|e| TrainError::TransientQuery(format!("DescribeTrainingJob {handle}: {e}")))?;

        let status = map_native_status(&response.training_job_status);
        Ok(StatusReport::new(status, response.training_job_status).with_message(response.failure_reason))
    }

    async fn cancel(&self, handle: &str) -> TrainResult<()> {
        let request = TrainingJobRef {
            training_job_name: name_from_handle(handle),
        };
        let _: serde_json::Value = self
            .client
            .post_json("/", &[("X-Amz-Target", TARGET_STOP)], &request)
            .await
            .map_err(|e| TrainError::Cancel(format!("StopTrainingJob {handle}: {e}")))?;
        info!(job_id = %self.ctx.job_id, arn = handle, "stop requested");
        Ok(())
    }
}
