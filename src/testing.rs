//! Scripted trainer double shared by the coordinator, reconciler and service
//! tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{TrainError, TrainResult};
use crate::staging::{DataStager, LocalBackend, StagedChannels};
use crate::state_machine::{JobStatus, Platform};
use crate::trainer::{
    StatusReport, Submission, Trainer, TrainerContext, TrainerFactory, TrainerRegistry, sagemaker,
};

/// One scripted answer to `query_status`.
#[derive(Debug, Clone)]
pub enum QueryStep {
    Native(&'static str),
    Transient(&'static str),
}

/// Shared behaviour and call counters for every trainer built from it.
pub struct Script {
    pub stage_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    pub initial_status: Mutex<JobStatus>,
    pub submit_error: Mutex<Option<String>>,
    pub cancel_error: Mutex<Option<String>>,
    pub query_delay: Mutex<Option<Duration>>,
    pub submit_delay: Mutex<Option<Duration>>,
    steps: Mutex<VecDeque<QueryStep>>,
    last: Mutex<QueryStep>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            stage_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            initial_status: Mutex::new(JobStatus::Submitted),
            submit_error: Mutex::new(None),
            cancel_error: Mutex::new(None),
            query_delay: Mutex::new(None),
            submit_delay: Mutex::new(None),
            steps: Mutex::new(VecDeque::new()),
            last: Mutex::new(QueryStep::Native("InProgress")),
        }
    }
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue native statuses; the last one repeats once the queue drains.
    pub fn push(&self, steps: impl IntoIterator<Item = QueryStep>) {
        self.steps.lock().unwrap().extend(steps);
    }

    pub fn submits(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn stages(&self) -> usize {
        self.stage_calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> QueryStep {
        let mut steps = self.steps.lock().unwrap();
        match steps.pop_front() {
            Some(step) => {
                *self.last.lock().unwrap() = step.clone();
                step
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

/// Trainer that stages for real (local backend) and answers everything else
/// from a [`Script`]. Native statuses use the SageMaker vocabulary.
pub struct ScriptedTrainer {
    platform: Platform,
    ctx: TrainerContext,
    stager: DataStager,
    script: Arc<Script>,
}

#[async_trait]
impl Trainer for ScriptedTrainer {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn context(&self) -> &TrainerContext {
        &self.ctx
    }

    fn stager(&self) -> &DataStager {
        &self.stager
    }

    async fn stage(&self, channels: &std::collections::BTreeMap<String, String>) -> TrainResult<StagedChannels> {
        self.script.stage_calls.fetch_add(1, Ordering::SeqCst);
        self.stager.stage(&self.ctx.work_dir, channels, None).await
    }

    async fn submit(&self, _staged: &StagedChannels) -> TrainResult<Submission> {
        self.script.submit_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.script.submit_error.lock().unwrap().clone() {
            return Err(TrainError::Submission(message));
        }
        Ok(Submission {
            handle: format!("handle-{}", self.ctx.job_id),
            status: *self.script.initial_status.lock().unwrap(),
        })
    }

    async fn query_status(&self, _handle: &str) -> TrainResult<StatusReport> {
        self.script.query_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.script.next_step() {
            QueryStep::Native(native) => {
                Ok(StatusReport::new(sagemaker::map_native_status(native), native))
            }
            QueryStep::Transient(message) => Err(TrainError::TransientQuery(message.to_string())),
        }
    }

    async fn cancel(&self, _handle: &str) -> TrainResult<()> {
        self.script.cancel_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.cancel_error.lock().unwrap().clone() {
            Some(message) => Err(TrainError::Cancel(message)),
            None => Ok(()),
        }
    }
}

/// Factory building [`ScriptedTrainer`]s for `platform` that share `script`.
pub fn scripted_factory(platform: Platform, script: Arc<Script>) -> TrainerFactory {
    Arc::new(move |ctx: TrainerContext| -> Box<dyn Trainer> {
        Box::new(ScriptedTrainer {
            platform,
            ctx,
            stager: DataStager::new(Arc::new(LocalBackend)),
            script: Arc::clone(&script),
        })
    })
}

/// Registry serving `platform` from `script`, requiring `required_keys`.
pub fn scripted_registry(
    platform: Platform,
    required_keys: &'static [&'static str],
    script: Arc<Script>,
) -> TrainerRegistry {
    TrainerRegistry::new().register(platform, required_keys, scripted_factory(platform, script))
}
