use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CredentialStore, JobFilter, JobStore};
use crate::credentials::Credential;
use crate::error::{TrainError, TrainResult};
use crate::state_machine::{JobId, JobPatch, JobStatus, Platform, TrainingJob};

/// Job store kept in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Jobs>,
}

#[derive(Default)]
struct Jobs {
    by_id: HashMap<JobId, Stored>,
    next_seq: u64,
}

// Insertion order breaks ties between jobs created in the same instant.
struct Stored {
    seq: u64,
    job: TrainingJob,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: TrainingJob) -> TrainResult<JobId> {
        let mut inner = self.inner.write().await;
        if inner.by_id.contains_key(&job.id) {
            return Err(TrainError::Store(format!("duplicate job id {}", job.id)));
        }
        let id = job.id.clone();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_id.insert(id.clone(), Stored { seq, job });
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> TrainResult<Option<TrainingJob>> {
        Ok(self.inner.read().await.by_id.get(id).map(|s| s.job.clone()))
    }

    async fn update_if_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        patch: JobPatch,
    ) -> TrainResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.by_id.get_mut(id) {
            Some(stored) if stored.job.status == expected => {
                stored.job.apply(patch);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_nonterminal(&self, platform: Option<Platform>) -> TrainResult<Vec<TrainingJob>> {
        let inner = self.inner.read().await;
        let mut out: Vec<&Stored> = inner
            .by_id
            .values()
            .filter(|s| !s.job.status.is_terminal())
            .filter(|s| platform.is_none_or(|p| s.job.platform == p))
            .collect();
        out.sort_by_key(|s| s.seq);
        Ok(out.into_iter().map(|s| s.job.clone()).collect())
    }

    async fn list(&self, filter: &JobFilter) -> TrainResult<Vec<TrainingJob>> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&Stored> = inner.by_id.values().filter(|s| filter.matches(&s.job)).collect();
        matching.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(matching
            .into_iter()
            .skip(filter.page.offset)
            .take(filter.page.limit)
            .map(|s| s.job.clone())
            .collect())
    }
}

/// Credential store kept in process memory.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, credential: Credential) {
        self.credentials
            .write()
            .await
            .insert(credential.id.clone(), credential);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, id: &str) -> TrainResult<Option<Credential>> {
        Ok(self.credentials.read().await.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::state_machine::JobDescription;
    use crate::store::Page;

    fn job(platform: Platform, owner: &str) -> TrainingJob {
        TrainingJob::new(JobDescription::new(platform, owner), Path::new("/tmp/work"))
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = MemoryJobStore::new();
        let id = store.create(job(Platform::Vertex, "a")).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert!(store.get(&JobId::from("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryJobStore::new();
        let j = job(Platform::Vertex, "a");
        store.create(j.clone()).await.unwrap();
        assert!(matches!(store.create(j).await, Err(TrainError::Store(_))));
    }

    #[tokio::test]
    async fn update_if_status_detects_stale_writer() {
        let store = MemoryJobStore::new();
        let id = store.create(job(Platform::Vertex, "a")).await.unwrap();

        let applied = store
            .update_if_status(&id, JobStatus::Pending, JobPatch::status(JobStatus::PreparingData))
            .await
            .unwrap();
        assert!(applied);

        let applied = store
            .update_if_status(&id, JobStatus::Pending, JobPatch::failed("late"))
            .await
            .unwrap();
        assert!(!applied);

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::PreparingData);
        assert!(loaded.last_error.is_none());
    }

    #[tokio::test]
    async fn concurrent_compare_and_set_applies_once() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.create(job(Platform::Vertex, "a")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_if_status(&id, JobStatus::Pending, JobPatch::status(JobStatus::PreparingData))
                    .await
                    .unwrap()
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(
            loaded.status_history,
            vec![JobStatus::Pending, JobStatus::PreparingData]
        );
    }

    #[tokio::test]
    async fn list_nonterminal_filters_platform_and_status() {
        let store = MemoryJobStore::new();
        let a = store.create(job(Platform::Vertex, "a")).await.unwrap();
        store.create(job(Platform::SageMaker, "a")).await.unwrap();
        let done = store.create(job(Platform::Vertex, "a")).await.unwrap();
        store
            .update_if_status(&done, JobStatus::Pending, JobPatch::failed("x"))
            .await
            .unwrap();

        let vertex = store.list_nonterminal(Some(Platform::Vertex)).await.unwrap();
        assert_eq!(vertex.len(), 1);
        assert_eq!(vertex[0].id, a);
        assert_eq!(store.list_nonterminal(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn list_filters_owner_status_and_pages() {
        let store = MemoryJobStore::new();
        for _ in 0..5 {
            store.create(job(Platform::Vertex, "alice")).await.unwrap();
        }
        store.create(job(Platform::Vertex, "bob")).await.unwrap();

        let filter = JobFilter {
            owner: Some("alice".into()),
            status: Some(JobStatus::Pending),
            page: Page { offset: 1, limit: 3 },
        };
        let page = store.list(&filter).await.unwrap();
        assert_eq!(page.len(), 3);
        assert!(page.iter().all(|j| j.owner == "alice"));

        let filter = JobFilter {
            owner: Some("alice".into()),
            status: Some(JobStatus::Running),
            page: Page::default(),
        };
        assert!(store.list(&filter).await.unwrap().is_empty());
    }
}
