//! Copies named input channels into a job's working directory.
//!
//! Every channel lands in `work_dir/input/<channel>`. Data is fetched into a
//! hidden partial directory first and renamed into place once complete, so a
//! channel directory that exists is always fully staged and re-running the
//! stager after a partial failure only fetches what is missing.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{TrainError, TrainResult};

/// Channel name to the local directory it was staged into.
pub type StagedChannels = BTreeMap<String, PathBuf>;

/// Where a job's channel URIs point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Local paths or `file://` URIs.
    #[default]
    Local,
    /// `http://` or `https://` URLs.
    Http,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch `uri` into `target_dir` and return the local path of the data.
    async fn fetch(&self, uri: &str, target_dir: &Path, auth: Option<&str>) -> TrainResult<PathBuf>;
}

/// Copies files or whole directory trees from the local filesystem.
pub struct LocalBackend;

fn local_source(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

fn copy_tree(source: &Path, target_dir: &Path) -> TrainResult<()> {
    if source.is_file() {
        let name = source
            .file_name()
            .ok_or_else(|| TrainError::Staging(format!("bad source path {}", source.display())))?;
        std::fs::copy(source, target_dir.join(name))?;
        return Ok(());
    }

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| TrainError::Staging(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| TrainError::Staging(e.to_string()))?;
        let dest = target_dir.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn fetch(&self, uri: &str, target_dir: &Path, _auth: Option<&str>) -> TrainResult<PathBuf> {
        let source = local_source(uri);
        if !tokio::fs::try_exists(&source).await? {
            return Err(TrainError::Staging(format!(
                "source {} does not exist",
                source.display()
            )));
        }

        let target = target_dir.to_path_buf();
        let dest = target.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| TrainError::Staging(format!("copy task failed: {e}")))??;
        Ok(target)
    }
}

/// Downloads a single object over HTTP(S).
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn file_name_for(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("data")
        .to_string()
}

#[async_trait]
impl StorageBackend for HttpBackend {
    async fn fetch(&self, uri: &str, target_dir: &Path, auth: Option<&str>) -> TrainResult<PathBuf> {
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Err(TrainError::Staging(format!("not an http(s) url: {uri}")));
        }

        let mut request = self.client.get(uri);
        if let Some(token) = auth {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| TrainError::Staging(format!("download {uri}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrainError::Staging(format!(
                "download {uri}: HTTP {}",
                status.as_u16()
            )));
        }
        let path = target_dir.join(file_name_for(uri));
        let mut file = tokio::fs::File::create(&path).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TrainError::Staging(format!("download {uri}: {e}")))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(source = uri, bytes = written, "download finished");
        Ok(path)
    }
}

/// Places channels under a working directory using one storage backend.
#[derive(Clone)]
pub struct DataStager {
    backend: Arc<dyn StorageBackend>,
}

impl DataStager {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Stager for the backend implied by `kind`.
    pub fn for_storage(kind: StorageKind, http: &reqwest::Client) -> Self {
        match kind {
            StorageKind::Local => Self::new(Arc::new(LocalBackend)),
            StorageKind::Http => Self::new(Arc::new(HttpBackend::new(http.clone()))),
        }
    }

    pub fn input_dir(work_dir: &Path) -> PathBuf {
        work_dir.join("input")
    }

    /// Stage every channel into `work_dir/input/<channel>`.
    pub async fn stage(
        &self,
        work_dir: &Path,
        channels: &BTreeMap<String, String>,
        auth: Option<&str>,
    ) -> TrainResult<StagedChannels> {
        let input_dir = Self::input_dir(work_dir);
        tokio::fs::create_dir_all(&input_dir).await.map_err(|e| {
            TrainError::Staging(format!("create {}: {e}", input_dir.display()))
        })?;

        let mut staged = StagedChannels::new();
        for (name, uri) in channels {
            validate_channel_name(name)?;
            let path = self
                .stage_channel(&input_dir, name, uri, auth)
                .await
                .map_err(|e| match e {
                    TrainError::Staging(msg) => TrainError::Staging(format!("channel {name}: {msg}")),
                    other => TrainError::Staging(format!("channel {name}: {other}")),
                })?;
            staged.insert(name.clone(), path);
        }
        Ok(staged)
    }

    async fn stage_channel(
        &self,
        input_dir: &Path,
        name: &str,
        uri: &str,
        auth: Option<&str>,
    ) -> TrainResult<PathBuf> {
        let destination = input_dir.join(name);
        if tokio::fs::try_exists(&destination).await? {
            debug!(channel = name, path = %destination.display(), "channel already staged");
            return Ok(destination);
        }

        remove_partials(input_dir, name).await?;

        let partial = input_dir.join(format!(".{name}.partial-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&partial).await?;
        if let Err(e) = self.backend.fetch(uri, &partial, auth).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&partial).await {
                warn!(channel = name, error = %cleanup, "failed to remove partial staging dir");
            }
            return Err(e);
        }

        tokio::fs::rename(&partial, &destination).await?;
        info!(channel = name, source = uri, path = %destination.display(), "channel staged");
        Ok(destination)
    }
}

fn validate_channel_name(name: &str) -> TrainResult<()> {
    let mut components = Path::new(name).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !single_normal || name.starts_with('.') {
        return Err(TrainError::Staging(format!("invalid channel name {name:?}")));
    }
    Ok(())
}

async fn remove_partials(input_dir: &Path, name: &str) -> TrainResult<()> {
    let prefix = format!(".{name}.partial-");
    let mut entries = tokio::fs::read_dir(input_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            debug!(channel = name, path = %entry.path().display(), "removing stale partial");
            tokio::fs::remove_dir_all(entry.path()).await?;
        }
    }
    Ok(())
}
