use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::coordinator::{CoordinatorSettings, SubmissionCoordinator, spawn_submission_workers};
use crate::error::{TrainError, TrainResult};
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::service::JobService;
use crate::store::{CredentialStore, JobStore};
use crate::trainer::TrainerRegistry;

/// HTTP client shared by every trainer and the HTTP storage backend.
///
/// Only connecting is bounded here. Whole operations are bounded by the
/// stage, submit and query timeouts in the coordinator and the reconciler.
pub fn http_client() -> TrainResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("trainyard/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| TrainError::Config(format!("http client: {e}")))
}

/// Running submission workers and reconciliation loops.
pub struct Engine {
    service: Arc<JobService>,
    reconciler: Arc<Reconciler>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Wire the coordinator, its worker pool, the reconciliation loops and the
    /// caller-facing service. Must be called inside a tokio runtime.
    pub fn start(
        config: &Config,
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        registry: TrainerRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (coordinator, queue) = SubmissionCoordinator::new(
            Arc::clone(&jobs),
            Arc::clone(&credentials),
            Arc::clone(&registry),
            CoordinatorSettings::from_config(config),
            config.queue_capacity,
        );
        let workers = spawn_submission_workers(
            Arc::clone(&coordinator),
            queue,
            config.submission_workers,
            shutdown_rx.clone(),
        );

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&jobs),
            Arc::clone(&credentials),
            Arc::clone(&registry),
            ReconcileSettings::from_config(config),
        ));
        let polling = Arc::clone(&reconciler).spawn(shutdown_rx);

        let service = Arc::new(JobService::new(jobs, credentials, registry, coordinator));
        info!(
            workers = config.submission_workers,
            poll_interval_secs = config.poll_interval_secs,
            "engine started"
        );

        Self {
            service,
            reconciler,
            shutdown,
            tasks: vec![workers, polling],
        }
    }

    pub fn service(&self) -> Arc<JobService> {
        Arc::clone(&self.service)
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    /// Stop accepting queued work and wait for in-flight submissions and
    /// polling loops to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "engine task failed");
            }
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::state_machine::{JobDescription, JobStatus, Platform};
    use crate::store::{MemoryCredentialStore, MemoryJobStore};
    use crate::testing::{QueryStep, Script, scripted_registry};
    use tempfile::TempDir;

    #[test]
    fn http_client_builds_from_defaults() {
        assert!(http_client().is_ok());
    }

    #[tokio::test]
    async fn downloads_may_outlast_submit_and_query_timeouts() {
        use crate::staging::{DataStager, StorageKind};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/train.csv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("a,b\n")
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let config = Config {
            stage_timeout_secs: 10,
            submit_timeout_secs: 1,
            query_timeout_secs: 1,
            ..Config::default()
        };
        assert!(Duration::from_millis(1500) > config.submit_timeout().max(config.query_timeout()));
        let work = TempDir::new().unwrap();
        let channels = BTreeMap::from([(
            "training".to_string(),
            format!("{}/data/train.csv", server.uri()),
        )]);
        let stager = DataStager::for_storage(StorageKind::Http, &http_client().unwrap());
        let staged = tokio::time::timeout(config.stage_timeout(), stager.stage(work.path(), &channels, None))
            .await
            .unwrap()
            .unwrap();
        assert!(staged["training"].join("train.csv").is_file());
    }

    #[tokio::test]
    async fn job_runs_to_completion() {
        let work = TempDir::new().unwrap();
        let config = Config {
            work_root: work.path().to_path_buf(),
            poll_interval_secs: 1,
            ..Config::default()
        };
        let script = Script::new();
        script.push([QueryStep::Native("InProgress"), QueryStep::Native("Completed")]);
        let engine = Engine::start(
            &config,
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryCredentialStore::new()),
            scripted_registry(Platform::SageMaker, &[], Arc::clone(&script)),
        );
        let service = engine.service();

        let mut desc = JobDescription::new(Platform::SageMaker, "0xabc");
        desc.channels = BTreeMap::new();
        let id = service.submit_job(desc).await.unwrap();

        let mut status = JobStatus::Pending;
        for _ in 0..60 {
            status = service.get_job(&id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            // Loops started on their first tick; drive them directly to keep
            // the test fast.
            engine.reconciler().sweep().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(script.submits(), 1);

        engine.shutdown().await;
    }
}
