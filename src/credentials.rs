//! Platform credentials and the ownership/platform checks run before a job
//! is allowed to consume staging or backend resources.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};
use crate::state_machine::Platform;
use crate::store::CredentialStore;

/// A stored platform credential.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub platform: Platform,
    pub owner: String,
    /// Tokens, role identifiers and similar secret material.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Credential {
    pub fn new(id: impl Into<String>, platform: Platform, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            platform,
            owner: owner.into(),
            secrets: BTreeMap::new(),
            active: true,
        }
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    pub fn secret(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(String::as_str)
    }
}

// Secret values never reach logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("owner", &self.owner)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("active", &self.active)
            .finish()
    }
}

/// Resolves a credential reference and checks it may be used for a job.
pub struct CredentialValidator {
    store: Arc<dyn CredentialStore>,
}

impl CredentialValidator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Returns the credential when it exists, is active, targets
    /// `job_platform` and belongs to `job_owner`.
    pub async fn validate(
        &self,
        credential_id: &str,
        job_platform: Platform,
        job_owner: &str,
    ) -> TrainResult<Credential> {
        let credential = self
            .store
            .get(credential_id)
            .await?
            .ok_or_else(|| TrainError::CredentialNotFound(credential_id.to_string()))?;

        if !credential.active {
            return Err(TrainError::CredentialInactive(credential_id.to_string()));
        }
        if credential.platform != job_platform {
            return Err(TrainError::PlatformMismatch {
                credential: credential.platform,
                job: job_platform,
            });
        }
        if credential.owner != job_owner {
            return Err(TrainError::OwnershipMismatch {
                credential_id: credential_id.to_string(),
                owner: job_owner.to_string(),
            });
        }
        Ok(credential)
    }
}
