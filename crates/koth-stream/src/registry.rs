//! Owner-gated registries for in-flight jobs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Implemented by every job kind that lives in a registry.
pub trait Registered {
    fn id(&self) -> &str;
    fn owner(&self) -> &str;
}

/// Process-wide registry for one job kind.
///
/// Each kind (upload, redeploy, teardown) gets its own registry; there is
/// no cross-kind lookup. Jobs stay registered after completion so late
/// subscribers can still replay the log.
pub struct JobRegistry<T: Registered> {
    jobs: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: Registered> JobRegistry<T> {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a job and return the shared handle.
    pub async fn register(&self, job: T) -> Arc<T> {
        let job = Arc::new(job);
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id().to_string(), job.clone());
        job
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: &str) -> Option<Arc<T>> {
        let jobs = self.jobs.read().await;
        jobs.get(id).cloned()
    }

    /// Fetch a job only if `viewer` owns it.
    pub async fn get_for_viewer(&self, id: &str, viewer: &str) -> Option<Arc<T>> {
        self.get(id).await.filter(|job| job.owner() == viewer)
    }

    /// Remove a job by id.
    pub async fn remove(&self, id: &str) -> Option<Arc<T>> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }
}

impl<T: Registered> Default for JobRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::UploadJob;

    #[tokio::test]
    async fn registry_enforces_owner_on_view() {
        let registry = JobRegistry::new();
        let job = registry.register(UploadJob::new("alice")).await;

        assert!(registry.get(job.id()).await.is_some());
        assert!(registry.get_for_viewer(job.id(), "alice").await.is_some());
        assert!(registry.get_for_viewer(job.id(), "bob").await.is_none());
        assert!(registry.get_for_viewer("missing", "alice").await.is_none());
    }

    #[tokio::test]
    async fn remove_drops_the_job() {
        let registry = JobRegistry::new();
        let job = registry.register(UploadJob::new("alice")).await;
        assert_eq!(registry.len().await, 1);

        registry.remove(job.id()).await;
        assert_eq!(registry.len().await, 0);
    }
}
