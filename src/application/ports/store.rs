use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Job, JobConfiguration, JobId, JobStatus};

/// Narrowing criteria for listing and latest-selection.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub since: Option<DateTime<Utc>>,
}

/// Persistence for per-job state and metadata. Every job owns a disjoint
/// directory; `state.json` and `meta.json` are written atomically on every
/// mutation.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Scaffold the job directory, copy the source into `media/`, and
    /// persist the initial state and configuration snapshot.
    async fn create(&self, source: &Path, configuration: JobConfiguration)
        -> Result<Job, StoreError>;

    async fn load(&self, id: &JobId) -> Result<Job, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Persist both `state.json` and `meta.json` atomically.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Remove the working directory.
    async fn delete(&self, id: &JobId) -> Result<(), StoreError>;

    /// The matching job with the most recent `updated_at`, if any. Backs
    /// stage commands invoked without an explicit id.
    async fn latest(&self, filter: &JobFilter) -> Result<Option<Job>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("source file not found: {0}")]
    SourceMissing(String),
    #[error("state unreadable at {path}: {message}")]
    Corrupt { path: String, message: String },
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
