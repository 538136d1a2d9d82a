use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use crate::application::ports::{JobFilter, JobStore, StoreError};
use crate::domain::{Job, JobConfiguration, JobId, JobMeta, JobState, JobStatus, StageName};

use super::{read_json_with_retry, write_json_atomic};

/// Filesystem-backed job store. Layout per job:
/// `<work>/<job_id>/{state.json, meta.json, media/, transcripts/, artifacts/, _stages/}`.
pub struct FsJobStore {
    work_root: PathBuf,
}

impl FsJobStore {
    pub fn new(work_root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let work_root = work_root.into();
        std::fs::create_dir_all(&work_root).map_err(|e| StoreError::io(&work_root, e))?;
        Ok(FsJobStore { work_root })
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    fn job_dir(&self, id: &JobId) -> PathBuf {
        self.work_root.join(id.as_str())
    }

    fn load_from_dir(&self, dir: &Path) -> Result<Job, StoreError> {
        let meta: JobMeta = read_json_with_retry(&dir.join("meta.json"))?;
        let state = match read_json_with_retry::<JobState>(&dir.join("state.json")) {
            Ok(state) => state,
            Err(StoreError::Corrupt { path, message }) => {
                tracing::warn!(path = %path, error = %message, "state.json unreadable, reconstructing from stage records");
                reconstruct_state(dir, &meta)
            }
            Err(e) => return Err(e),
        };
        Ok(Job {
            id: JobId::from_string(meta.job_id.clone()),
            dir: dir.to_path_buf(),
            state,
            meta,
        })
    }
}

/// Rebuild a state ledger from `_stages/*.json` records. Stages with a
/// record are treated as completed; without any record the job is surfaced
/// as failed so the operator can retry or delete it.
fn reconstruct_state(dir: &Path, meta: &JobMeta) -> JobState {
    let mut state = JobState::new(meta.created_at);
    let stages_dir = dir.join("_stages");
    let mut any = false;
    for stage in StageName::ALL {
        if stages_dir.join(format!("{}.json", stage)).is_file() {
            state.mark_completed(stage, meta.updated_at);
            any = true;
        }
    }
    if !any {
        state.status = JobStatus::Failed;
    }
    state.updated_at = meta.updated_at;
    state
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn create(
        &self,
        source: &Path,
        configuration: JobConfiguration,
    ) -> Result<Job, StoreError> {
        if !source.is_file() {
            return Err(StoreError::SourceMissing(source.display().to_string()));
        }

        let now = Utc::now();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut id = JobId::generate(now, &stem);
        // Same source in the same second: disambiguate rather than reuse
        // another job's directory.
        let mut duplicate = 1;
        while self.job_dir(&id).exists() {
            duplicate += 1;
            id = JobId::from_string(format!(
                "{}-{}",
                JobId::generate(now, &stem),
                duplicate
            ));
        }
        let dir = self.job_dir(&id);

        for sub in ["media", "transcripts", "artifacts", "_stages"] {
            let path = dir.join(sub);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
        }

        let extension = source
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "bin".to_string());
        let working_copy = dir.join("media").join(format!("original.{}", extension));
        tokio::fs::copy(source, &working_copy)
            .await
            .map_err(|e| StoreError::io(&working_copy, e))?;

        let job = Job {
            id: id.clone(),
            dir,
            state: JobState::new(now),
            meta: JobMeta::new(
                id.as_str().to_string(),
                source.display().to_string(),
                now,
                configuration,
            ),
        };
        self.save(&job).await?;

        tracing::info!(job_id = %job.id, source = %source.display(), "created job");
        Ok(job)
    }

    async fn load(&self, id: &JobId) -> Result<Job, StoreError> {
        let dir = self.job_dir(id);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.load_from_dir(&dir)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.work_root)
            .await
            .map_err(|e| StoreError::io(&self.work_root, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.work_root, e))?
        {
            let path = entry.path();
            if !path.is_dir() || !path.join("meta.json").is_file() {
                continue;
            }
            match self.load_from_dir(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(dir = %path.display(), error = %e, "skipping unreadable job");
                }
            }
        }

        jobs.retain(|job| {
            filter.status.map_or(true, |s| job.state.status == s)
                && filter.since.map_or(true, |t| job.state.created_at >= t)
        });
        jobs.sort_by(|a, b| b.state.created_at.cmp(&a.state.created_at));
        Ok(jobs)
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        write_json_atomic(&job.state_path(), &job.state)?;
        write_json_atomic(&job.meta_path(), &job.meta)?;
        Ok(())
    }

    async fn delete(&self, id: &JobId) -> Result<(), StoreError> {
        let dir = self.job_dir(id);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        tracing::info!(job_id = %id, "deleted job directory");
        Ok(())
    }

    async fn latest(&self, filter: &JobFilter) -> Result<Option<Job>, StoreError> {
        let jobs = self.list(filter).await?;
        Ok(jobs
            .into_iter()
            .max_by_key(|job| job.state.updated_at))
    }
}
