use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::application::ports::{JobFilter, JobStore, StoreError};
use crate::domain::{Job, JobConfiguration, JobId, JobStatus, StageName, StageStatus};
use crate::infrastructure::templates::{TemplateError, TemplateRegistry};

use super::pipeline::place_artifacts;

/// Job lifecycle outside the pipeline proper: creation (with schema
/// validation and the configuration snapshot), implicit latest-selection,
/// retry resets, retention cleanup, and finalization with conditional
/// artifact pruning.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    templates: Arc<TemplateRegistry>,
    results_root: PathBuf,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        templates: Arc<TemplateRegistry>,
        results_root: impl Into<PathBuf>,
    ) -> Self {
        JobManager {
            store,
            templates,
            results_root: results_root.into(),
        }
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    /// Create a job. Template schemas are validated first: a conflicting
    /// artifact list must fail before any working directory exists.
    pub async fn create_job(
        &self,
        source: &Path,
        configuration: JobConfiguration,
    ) -> Result<Job, ManagerError> {
        self.templates.collect_schema(&configuration.artifacts)?;
        let job = self.store.create(source, configuration).await?;
        Ok(job)
    }

    pub async fn load(&self, id: &str) -> Result<Job, ManagerError> {
        Ok(self.store.load(&JobId::from_string(id.to_string())).await?)
    }

    /// The explicitly named job, or the most recently updated one when the
    /// stage commands are invoked without an id.
    pub async fn resolve(&self, id: Option<&str>) -> Result<Job, ManagerError> {
        match id {
            Some(id) => self.load(id).await,
            None => self
                .store
                .latest(&JobFilter::default())
                .await?
                .ok_or(ManagerError::NoJobs),
        }
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, ManagerError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), ManagerError> {
        Ok(self
            .store
            .delete(&JobId::from_string(id.to_string()))
            .await?)
    }

    /// Reset `from` and every later stage to pending, clearing their
    /// artifacts. Re-execution is destructive by design; with debug set,
    /// cleared artifacts move to `_stages/trash/<timestamp>/` instead of
    /// being deleted.
    pub async fn reset_from(&self, job: &mut Job, from: StageName) -> Result<(), ManagerError> {
        let reset = job.state.reset_from(from, Utc::now());
        self.clear_stage_artifacts(job, &reset)?;
        job.meta
            .processing
            .stages_completed
            .retain(|name| name.parse::<StageName>().map(|s| s < from).unwrap_or(false));
        job.meta.updated_at = job.state.updated_at;
        self.store.save(job).await?;
        tracing::info!(job_id = %job.id, from = %from, "reset job for re-execution");
        Ok(())
    }

    /// The stage `retry` starts from when none is given: the first stage
    /// that is not completed.
    pub fn default_retry_stage(&self, job: &Job) -> StageName {
        StageName::ALL
            .into_iter()
            .find(|s| job.state.stage(*s).status != StageStatus::Completed)
            .unwrap_or(StageName::Ingest)
    }

    fn clear_stage_artifacts(&self, job: &Job, stages: &[StageName]) -> Result<(), ManagerError> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for stage in stages {
            match stage {
                StageName::Ingest => {
                    paths.push(job.ingest_result_path());
                    paths.push(job.media_dir().join("compressed.ogg"));
                }
                StageName::Scribe => {
                    paths.push(job.raw_transcript_path());
                    paths.push(job.partial_transcript_path());
                    paths.push(job.stage_record_path(StageName::Scribe));
                }
                StageName::Refine => {
                    paths.push(job.enriched_context_path());
                    paths.push(job.stage_record_path(StageName::Refine));
                }
                StageName::Generate => {
                    paths.push(job.stage_record_path(StageName::Generate));
                    if let Ok(entries) = std::fs::read_dir(job.artifacts_dir()) {
                        paths.extend(entries.filter_map(|e| e.ok()).map(|e| e.path()));
                    }
                }
                StageName::Shelve => {
                    paths.push(job.stage_record_path(StageName::Shelve));
                }
            }
        }

        let trash = job
            .trash_dir()
            .join(Utc::now().format("%Y%m%dT%H%M%S").to_string());
        let keep_in_trash = job.meta.configuration.debug;
        if keep_in_trash {
            std::fs::create_dir_all(&trash).map_err(|e| ManagerError::Io {
                path: trash.display().to_string(),
                source: e,
            })?;
        }

        for path in paths {
            if !path.exists() {
                continue;
            }
            if keep_in_trash {
                let Some(file_name) = path.file_name() else {
                    continue;
                };
                let target = trash.join(file_name);
                if let Err(e) = std::fs::rename(&path, &target) {
                    tracing::warn!(path = %path.display(), error = %e, "could not move artifact to trash");
                }
            } else if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "could not remove artifact");
            }
        }
        Ok(())
    }

    /// Finalize a job after SHELVE: prune the heavy directories unless debug
    /// is set. `state.json`, `meta.json`, and `_stages/` always survive.
    pub async fn finalize(&self, job: &mut Job) -> Result<(), ManagerError> {
        if job.meta.configuration.debug {
            tracing::info!(job_id = %job.id, "debug set, keeping the full working directory");
            return Ok(());
        }

        for dir in [job.media_dir(), job.transcripts_dir(), job.artifacts_dir()] {
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir).map_err(|e| ManagerError::Io {
                    path: dir.display().to_string(),
                    source: e,
                })?;
            }
        }
        job.meta.updated_at = Utc::now();
        self.store.save(job).await?;
        tracing::info!(job_id = %job.id, "pruned working directory");
        Ok(())
    }

    /// Copy artifacts to the results library (idempotent) and prune. Backs
    /// `jobs finalize`.
    pub async fn finalize_with_placement(&self, job: &mut Job) -> Result<PathBuf, ManagerError> {
        let placement = place_artifacts(job, &self.results_root)
            .map_err(|e| ManagerError::Finalize(e.to_string()))?;
        self.finalize(job).await?;
        Ok(placement.destination)
    }

    /// Delete jobs whose state is terminal and stable and older than the
    /// retention window. Safe to run beside active drivers: running jobs
    /// are never considered.
    pub async fn cleanup(
        &self,
        older_than_days: i64,
        status: Option<JobStatus>,
    ) -> Result<usize, ManagerError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let jobs = self.store.list(&JobFilter::default()).await?;
        let mut removed = 0;

        for job in jobs {
            if !job.state.status.is_terminal() {
                continue;
            }
            if job.state.updated_at > cutoff {
                continue;
            }
            if let Some(status) = status {
                if job.state.status != status {
                    continue;
                }
            }
            match self.store.delete(&job.id).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(job_id = %job.id, status = %job.state.status, "cleaned up old job");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "cleanup failed for job");
                }
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no jobs in the working root")]
    NoJobs,
    #[error("finalization failed: {0}")]
    Finalize(String),
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
