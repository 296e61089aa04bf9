//! Hugging Face Space backend.
//!
//! Creating the space is the whole job: there is no remote lifecycle to poll,
//! so a submitted space reports `COMPLETED` on its first status query.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    BackendClient, StatusReport, Submission, Trainer, TrainerContext, check_script_config,
};
use crate::error::{TrainError, TrainResult};
use crate::staging::{DataStager, StagedChannels};
use crate::state_machine::{JobStatus, Platform};

pub const REQUIRED_KEYS: &[&str] = &["space_id", "hardware"];

/// Credential secret holding the Hub access token.
pub const TOKEN_SECRET: &str = "hf_token";

/// The only status a created space ever has.
const CREATED: &str = "created";

/// Native-to-canonical status table.
pub fn map_native_status(native: &str) -> JobStatus {
    match native {
        CREATED => JobStatus::Completed,
        _ => JobStatus::Unknown,
    }
}

#[derive(Debug, Serialize)]
struct CreateSpaceRequest {
    #[serde(rename = "type")]
    repo_type: &'static str,
    name: String,
    private: bool,
    sdk: &'static str,
    hardware: String,
    variables: Vec<SpaceVariable>,
}

#[derive(Debug, Serialize)]
struct SpaceVariable {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct CreateSpaceResponse {
    url: String,
}

pub struct HuggingFaceTrainer {
    ctx: TrainerContext,
    client: BackendClient,
    stager: DataStager,
}

impl HuggingFaceTrainer {
    pub fn new(ctx: TrainerContext, http: reqwest::Client, base_url: &str) -> Self {
        let token = ctx.secret(TOKEN_SECRET).map(str::to_string);
        let stager = DataStager::for_storage(ctx.storage, &http);
        Self {
            client: BackendClient::new(http, base_url, token),
            stager,
            ctx,
        }
    }

    fn variables(&self, staged: &StagedChannels) -> TrainResult<Vec<SpaceVariable>> {
        let mut variables = vec![SpaceVariable {
            key: "HYPERPARAMETERS".to_string(),
            value: serde_json::to_string(&self.ctx.hyperparameter_strings())?,
        }];
        variables.extend(staged.iter().map(|(name, path)| SpaceVariable {
            key: format!("CHANNEL_{}", name.to_ascii_uppercase()),
            value: path.display().to_string(),
        }));
        Ok(variables)
    }
}

#[async_trait]
impl Trainer for HuggingFaceTrainer {
    fn platform(&self) -> Platform {
        Platform::HuggingFace
    }

    fn context(&self) -> &TrainerContext {
        &self.ctx
    }

    fn stager(&self) -> &DataStager {
        &self.stager
    }

    async fn submit(&self, staged: &StagedChannels) -> TrainResult<Submission> {
        check_script_config(Platform::HuggingFace, &self.ctx.script_config, REQUIRED_KEYS)?;
        let space_id = self.ctx.script_value("space_id").unwrap_or_default();
        let hardware = self.ctx.script_value("hardware").unwrap_or_default();

        let request = CreateSpaceRequest {
            repo_type: "space",
            name: space_id.clone(),
            private: true,
            sdk: "docker",
            hardware,
            variables: self.variables(staged)?,
        };
        let response: CreateSpaceResponse = self
            .client
            .post_json("/api/repos/create", &[], &request)
            .await
            .map_err(|e| TrainError::Submission(format!("create space {space_id}: {e}")))?;

        info!(job_id = %self.ctx.job_id, space = %space_id, url = %response.url, "space created");
        Ok(Submission {
            handle: space_id,
            status: JobStatus::Submitted,
        })
    }

    async fn query_status(&self, _handle: &str) -> TrainResult<StatusReport> {
        Ok(StatusReport::new(map_native_status(CREATED), CREATED))
    }

    async fn cancel(&self, handle: &str) -> TrainResult<()> {
        info!(job_id = %self.ctx.job_id, space = handle, "spaces have no run to stop");
        Ok(())
    }
}
