//! Run files consumed by the CLI: credentials plus the jobs to submit.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::credentials::{Credential, CredentialValidator};
use crate::state_machine::JobDescription;
use crate::store::MemoryCredentialStore;
use crate::trainer::{TrainerRegistry, check_script_config};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub jobs: Vec<JobDescription>,
}

/// A problem found in one job of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestIssue {
    pub job: usize,
    pub message: String,
}

impl fmt::Display for ManifestIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job #{}: {}", self.job + 1, self.message)
    }
}

impl Manifest {
    /// Read a manifest; `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let manifest = if is_json {
            serde_json::from_str(&contents)
                .with_context(|| format!("invalid JSON in {}", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("invalid TOML in {}", path.display()))?
        };
        Ok(manifest)
    }

    /// Credential store seeded with the manifest's credentials.
    pub async fn credential_store(&self) -> MemoryCredentialStore {
        let store = MemoryCredentialStore::new();
        for credential in &self.credentials {
            store.insert(credential.clone()).await;
        }
        store
    }

    /// Run the synchronous submission checks against every job without
    /// creating anything or contacting a backend.
    pub async fn check(&self, registry: &TrainerRegistry) -> Vec<ManifestIssue> {
        let validator = CredentialValidator::new(Arc::new(self.credential_store().await));
        let mut issues = Vec::new();

        for (index, job) in self.jobs.iter().enumerate() {
            let mut report = |message: String| {
                issues.push(ManifestIssue {
                    job: index,
                    message,
                })
            };
            match registry.resolve(job.platform) {
                Ok(entry) => {
                    if let Err(e) = check_script_config(job.platform, &job.script_config, entry.required_keys) {
                        report(e.to_string());
                    }
                }
                Err(e) => report(e.to_string()),
            }
            if let Some(credential_id) = &job.credential_id {
                if let Err(e) = validator.validate(credential_id, job.platform, &job.owner).await {
                    report(e.to_string());
                }
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state_machine::Platform;
    use tempfile::TempDir;

    const TOML_MANIFEST: &str = r#"
        [[credentials]]
        id = "sm"
        platform = "sagemaker"
        owner = "0xabc"
        secrets = { role_arn = "arn:aws:iam::1:role/train", token = "t" }

        [[jobs]]
        platform = "sagemaker"
        owner = "0xabc"
        credential_id = "sm"
        channels = { training = "./data/train" }
        hyperparameters = { epochs = 3, lr = 0.01 }
        script_config = { image_uri = "img:1", instance_type = "ml.m5.large" }

        [[jobs]]
        platform = "vertex"
        owner = "0xabc"
        credential_id = "sm"
        script_config = { project = "p" }
    "#;

    fn registry() -> TrainerRegistry {
        TrainerRegistry::builtin(&Config::default().backends, reqwest::Client::new())
    }

    #[test]
    fn loads_toml_by_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.toml");
        std::fs::write(&path, TOML_MANIFEST).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.credentials.len(), 1);
        assert_eq!(manifest.credentials[0].secret("token"), Some("t"));
        assert_eq!(manifest.jobs.len(), 2);
        assert_eq!(manifest.jobs[0].platform, Platform::SageMaker);
        assert_eq!(manifest.jobs[0].hyperparameters["epochs"], 3);
    }

    #[test]
    fn loads_json_by_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(
            &path,
            r#"{"jobs": [{"platform": "huggingface", "owner": "me", "script_config": {"space_id": "me/s", "hardware": "t4-small"}}]}"#,
        )
        .unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert!(manifest.credentials.is_empty());
        assert_eq!(manifest.jobs[0].platform, Platform::HuggingFace);
    }

    #[test]
    fn unknown_platform_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.toml");
        std::fs::write(&path, "[[jobs]]\nplatform = \"azureml\"\nowner = \"me\"\n").unwrap();
        let err = Manifest::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("azureml"));
    }

    #[tokio::test]
    async fn check_reports_missing_keys_and_credential_mismatch() {
        let manifest: Manifest = toml::from_str(TOML_MANIFEST).unwrap();
        let issues = manifest.check(&registry()).await;

        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|issue| issue.job == 1));
        assert!(issues[0].message.contains("region"));
        assert!(issues[1].message.contains("does not match"));
        assert!(issues[0].to_string().starts_with("job #2:"));
    }

    #[tokio::test]
    async fn check_reports_unregistered_platform() {
        let manifest = Manifest {
            credentials: Vec::new(),
            jobs: vec![JobDescription::new(Platform::Vertex, "me")],
        };
        let issues = manifest.check(&TrainerRegistry::new()).await;
        assert_eq!(issues[0].message, "Unsupported platform: vertex");
    }
}
