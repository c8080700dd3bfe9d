//! Specialized jobs: metadata wrappers over the stream kernel.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::job::StreamJob;
use crate::logger::JobLogger;
use crate::registry::Registered;

/// Lifecycle status of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Provisioning,
    Completed,
    Failed,
}

struct UploadState {
    status: UploadStatus,
    error: String,
    error_detail: String,
}

/// An archive-upload/provisioning job.
pub struct UploadJob {
    stream: StreamJob,
    state: Mutex<UploadState>,
}

impl UploadJob {
    pub fn new(owner: &str) -> Self {
        Self {
            stream: StreamJob::new("job", owner),
            state: Mutex::new(UploadState {
                status: UploadStatus::Pending,
                error: String::new(),
                error_detail: String::new(),
            }),
        }
    }

    pub fn stream(&self) -> &StreamJob {
        &self.stream
    }

    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        self.stream.subscribe()
    }

    pub fn set_status(&self, status: UploadStatus) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.status = status;
    }

    /// Record failure detail and close the stream.
    pub fn fail(&self, message: &str, detail: Option<&str>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.status = UploadStatus::Failed;
            state.error = message.to_string();
            state.error_detail = detail.unwrap_or_default().to_string();
        }
        self.stream.mark_done();
    }

    /// Mark success and close the stream.
    pub fn complete(&self) {
        self.set_status(UploadStatus::Completed);
        self.stream.mark_done();
    }

    /// Summary for the job-status endpoint.
    pub fn summary(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        serde_json::json!({
            "id": self.stream.id,
            "owner": self.stream.owner,
            "createdAt": self.stream.created_at,
            "status": state.status,
            "error": state.error,
            "errorDetail": state.error_detail,
            "logCount": self.stream.log_len(),
        })
    }
}

impl JobLogger for UploadJob {
    fn status(&self, message: &str) {
        self.stream.append(message);
    }

    fn error(&self, message: &str) {
        self.stream.append(format!("ERROR: {message}"));
    }

    fn success(&self, message: &str) {
        self.stream.append(message);
    }
}

impl Registered for UploadJob {
    fn id(&self) -> &str {
        &self.stream.id
    }

    fn owner(&self) -> &str {
        &self.stream.owner
    }
}

/// A redeploy job carrying its target container ids.
pub struct RedeployJob {
    stream: StreamJob,
    pub container_ids: Vec<i64>,
    pub start_after: bool,
}

impl RedeployJob {
    pub fn new(owner: &str, container_ids: Vec<i64>, start_after: bool) -> Self {
        Self {
            stream: StreamJob::new("redeploy_job", owner),
            container_ids,
            start_after,
        }
    }

    pub fn stream(&self) -> &StreamJob {
        &self.stream
    }

    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        self.stream.subscribe()
    }

    pub fn mark_done(&self) {
        self.stream.mark_done();
    }
}

impl JobLogger for RedeployJob {
    fn status(&self, message: &str) {
        self.stream.append(message);
    }

    fn error(&self, message: &str) {
        self.stream.append(format!("ERROR: {message}"));
    }

    fn success(&self, message: &str) {
        self.stream.append(message);
    }
}

impl Registered for RedeployJob {
    fn id(&self) -> &str {
        &self.stream.id
    }

    fn owner(&self) -> &str {
        &self.stream.owner
    }
}

/// A teardown job bound to one competition.
pub struct TeardownJob {
    stream: StreamJob,
    pub competition_id: String,
}

impl TeardownJob {
    pub fn new(owner: &str, competition_id: &str) -> Self {
        Self {
            stream: StreamJob::new("teardown_job", owner),
            competition_id: competition_id.to_string(),
        }
    }

    pub fn stream(&self) -> &StreamJob {
        &self.stream
    }

    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        self.stream.subscribe()
    }

    pub fn mark_done(&self) {
        self.stream.mark_done();
    }
}

impl JobLogger for TeardownJob {
    fn status(&self, message: &str) {
        self.stream.append(message);
    }

    fn error(&self, message: &str) {
        self.stream.append(format!("ERROR: {message}"));
    }

    fn success(&self, message: &str) {
        self.stream.append(message);
    }
}

impl Registered for TeardownJob {
    fn id(&self) -> &str {
        &self.stream.id
    }

    fn owner(&self) -> &str {
        &self.stream.owner
    }
}
