//! Configuração do trainyard carregada a partir de `trainyard.toml`.
//!
//! A struct [`Config`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente `TRAINYARD_*` têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{TrainError, TrainResult};
use crate::state_machine::Platform;

pub const DEFAULT_CONFIG_FILE: &str = "trainyard.toml";

/// Configuração de nível superior carregada de `trainyard.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Diretório raiz dos diretórios de trabalho dos jobs.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    /// Quantas submissões (staging + criação remota) rodam em paralelo.
    #[serde(default = "default_submission_workers")]
    pub submission_workers: usize,

    /// Capacidade da fila de submissão.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Intervalo entre ciclos de reconciliação, por plataforma.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Consultas de status simultâneas por plataforma.
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    #[serde(default)]
    pub backends: BackendsConfig,
}

/// Endpoints das plataformas externas.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    #[serde(default = "default_huggingface")]
    pub huggingface: BackendEndpoint,
    #[serde(default = "default_sagemaker")]
    pub sagemaker: BackendEndpoint,
    #[serde(default = "default_vertex")]
    pub vertex: BackendEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendEndpoint {
    pub base_url: String,
    /// Sobrescreve `max_concurrent_queries` para esta plataforma.
    #[serde(default)]
    pub max_concurrent_queries: Option<usize>,
}

impl BackendEndpoint {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            max_concurrent_queries: None,
        }
    }
}

// Diretório padrão: "./trainyard-work".
fn default_work_root() -> PathBuf {
    PathBuf::from("./trainyard-work")
}

fn default_submission_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_submit_timeout_secs() -> u64 {
    120
}

fn default_query_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_queries() -> usize {
    8
}

fn default_huggingface() -> BackendEndpoint {
    BackendEndpoint::new("https://huggingface.co")
}

fn default_sagemaker() -> BackendEndpoint {
    BackendEndpoint::new("https://api.sagemaker.us-east-1.amazonaws.com")
}

fn default_vertex() -> BackendEndpoint {
    BackendEndpoint::new("https://us-central1-aiplatform.googleapis.com")
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            huggingface: default_huggingface(),
            sagemaker: default_sagemaker(),
            vertex: default_vertex(),
        }
    }
}

impl BackendsConfig {
    pub fn endpoint(&self, platform: Platform) -> &BackendEndpoint {
        match platform {
            Platform::HuggingFace => &self.huggingface,
            Platform::SageMaker => &self.sagemaker,
            Platform::Vertex => &self.vertex,
        }
    }

    fn endpoint_mut(&mut self, platform: Platform) -> &mut BackendEndpoint {
        match platform {
            Platform::HuggingFace => &mut self.huggingface,
            Platform::SageMaker => &mut self.sagemaker,
            Platform::Vertex => &mut self.vertex,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            submission_workers: default_submission_workers(),
            queue_capacity: default_queue_capacity(),
            poll_interval_secs: default_poll_interval_secs(),
            stage_timeout_secs: default_stage_timeout_secs(),
            submit_timeout_secs: default_submit_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            max_concurrent_queries: default_max_concurrent_queries(),
            backends: BackendsConfig::default(),
        }
    }
}

impl Config {
    /// Carrega `trainyard.toml` do diretório atual, com defaults se ausente.
    pub fn load() -> TrainResult<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Carrega a configuração do caminho dado e aplica as variáveis de ambiente.
    pub fn load_from(path: &Path) -> TrainResult<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Variáveis de ambiente têm precedência sobre o arquivo.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(root) = lookup("TRAINYARD_WORK_ROOT") {
            self.work_root = PathBuf::from(root);
        }
        for platform in Platform::ALL {
            let key = format!("TRAINYARD_{}_URL", platform.as_str().to_ascii_uppercase());
            if let Some(url) = lookup(&key) {
                self.backends.endpoint_mut(platform).base_url = url;
            }
        }
    }

    pub fn validate(&self) -> TrainResult<()> {
        let positive = [
            ("submission_workers", self.submission_workers as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("poll_interval_secs", self.poll_interval_secs),
            ("stage_timeout_secs", self.stage_timeout_secs),
            ("submit_timeout_secs", self.submit_timeout_secs),
            ("query_timeout_secs", self.query_timeout_secs),
            ("max_concurrent_queries", self.max_concurrent_queries as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(TrainError::Config(format!("{name} must be greater than zero")));
        }
        for platform in Platform::ALL {
            let endpoint = self.backends.endpoint(platform);
            if endpoint.max_concurrent_queries == Some(0) {
                return Err(TrainError::Config(format!(
                    "backends.{platform}.max_concurrent_queries must be greater than zero"
                )));
            }
            if endpoint.base_url.trim().is_empty() {
                return Err(TrainError::Config(format!("backends.{platform}.base_url is empty")));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Limite de consultas simultâneas para a plataforma.
    pub fn query_concurrency(&self, platform: Platform) -> usize {
        self.backends
            .endpoint(platform)
            .max_concurrent_queries
            .unwrap_or(self.max_concurrent_queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.submission_workers, 4);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.query_timeout(), Duration::from_secs(30));
        assert_eq!(config.query_concurrency(Platform::Vertex), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            poll_interval_secs = 5
            max_concurrent_queries = 2

            [backends.sagemaker]
            base_url = "http://localhost:9000"
            max_concurrent_queries = 1
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.backends.sagemaker.base_url, "http://localhost:9000");
        assert_eq!(config.query_concurrency(Platform::SageMaker), 1);
        assert_eq!(config.query_concurrency(Platform::Vertex), 2);
        assert_eq!(config.backends.vertex.base_url, default_vertex().base_url);
        assert_eq!(config.stage_timeout_secs, 600);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TRAINYARD_WORK_ROOT", "/scratch"),
            ("TRAINYARD_VERTEX_URL", "http://vertex.local"),
            ("TRAINYARD_SAGEMAKER_URL", "  "),
        ]);
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.work_root, PathBuf::from("/scratch"));
        assert_eq!(config.backends.vertex.base_url, "http://vertex.local");
        assert_eq!(config.backends.sagemaker.base_url, default_sagemaker().base_url);
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = Config {
            submission_workers: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("submission_workers"));

        let mut config = Config::default();
        config.backends.vertex.max_concurrent_queries = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/trainyard.toml")).unwrap();
        assert_eq!(config.queue_capacity, 256);
    }
}
