use std::collections::BTreeMap;
use std::sync::Arc;

use super::{HuggingFaceTrainer, SageMakerTrainer, Trainer, TrainerContext, VertexTrainer};
use super::{huggingface, sagemaker, vertex};
use crate::config::BackendsConfig;
use crate::error::{TrainError, TrainResult};
use crate::state_machine::Platform;

/// Builds a trainer for one operation on one job.
pub type TrainerFactory = Arc<dyn Fn(TrainerContext) -> Box<dyn Trainer> + Send + Sync>;

/// A registered platform: its constructor and required script keys.
#[derive(Clone)]
pub struct TrainerEntry {
    pub platform: Platform,
    pub required_keys: &'static [&'static str],
    factory: TrainerFactory,
}

impl TrainerEntry {
    pub fn build(&self, ctx: TrainerContext) -> Box<dyn Trainer> {
        (self.factory)(ctx)
    }
}

/// Static mapping from platform to trainer constructor.
///
/// Filled in once at startup through the consuming [`register`](Self::register)
/// builder and shared behind an `Arc` afterwards, so it never changes while
/// requests are served.
#[derive(Clone, Default)]
pub struct TrainerRegistry {
    entries: BTreeMap<Platform, TrainerEntry>,
}

impl TrainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in platform, pointed at the configured endpoints.
    pub fn builtin(backends: &BackendsConfig, http: reqwest::Client) -> Self {
        let hf_url = backends.huggingface.base_url.clone();
        let hf_http = http.clone();
        let sm_url = backends.sagemaker.base_url.clone();
        let sm_http = http.clone();
        let vx_url = backends.vertex.base_url.clone();
        let vx_http = http;

        Self::new()
            .register(
                Platform::HuggingFace,
                huggingface::REQUIRED_KEYS,
                Arc::new(move |ctx: TrainerContext| -> Box<dyn Trainer> {
                    Box::new(HuggingFaceTrainer::new(ctx, hf_http.clone(), &hf_url))
                }),
            )
            .register(
                Platform::SageMaker,
                sagemaker::REQUIRED_KEYS,
                Arc::new(move |ctx: TrainerContext| -> Box<dyn Trainer> {
                    Box::new(SageMakerTrainer::new(ctx, sm_http.clone(), &sm_url))
                }),
            )
            .register(
                Platform::Vertex,
                vertex::REQUIRED_KEYS,
                Arc::new(move |ctx: TrainerContext| -> Box<dyn Trainer> {
                    Box::new(VertexTrainer::new(ctx, vx_http.clone(), &vx_url))
                }),
            )
    }

    pub fn register(
        mut self,
        platform: Platform,
        required_keys: &'static [&'static str],
        factory: TrainerFactory,
    ) -> Self {
        self.entries.insert(
            platform,
            TrainerEntry {
                platform,
                required_keys,
                factory,
            },
        );
        self
    }

    pub fn resolve(&self, platform: Platform) -> TrainResult<&TrainerEntry> {
        self.entries
            .get(&platform)
            .ok_or_else(|| TrainError::UnsupportedPlatform(platform.to_string()))
    }

    /// Resolve a platform given by name, as read from a manifest or request.
    pub fn resolve_name(&self, name: &str) -> TrainResult<&TrainerEntry> {
        self.resolve(name.parse::<Platform>()?)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.entries.keys().copied().collect()
    }
}
