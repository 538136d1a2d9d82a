mod generate;
mod ingest;
mod refine;
mod scribe;
mod shelve;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub use generate::GenerateStage;
pub use ingest::IngestStage;
pub use refine::RefineStage;
pub use scribe::ScribeStage;
pub use shelve::{place_artifacts, Placement, ShelveStage};

use crate::application::ports::{
    JobStore, MediaToolError, RefinementError, RenderError, StoreError, TranscriptionError,
};
use crate::domain::{Job, StageName, UsageRecord};
use crate::infrastructure::providers::RegistryError;
use crate::infrastructure::store::write_json_atomic;
use crate::infrastructure::templates::TemplateError;

/// A prerequisite an upstream stage was supposed to produce is missing.
/// Carries the actionable hint naming the command that would produce it.
#[derive(Debug, thiserror::Error)]
pub enum PrereqError {
    #[error("source file missing: {path}")]
    FileMissing { path: PathBuf },
    #[error("source file is empty: {path}")]
    FileEmpty { path: PathBuf },
    #[error("ingest result not found")]
    MissingIngest,
    #[error("no refine input: neither a valid raw transcript nor a direct-mode ingest result")]
    MissingRefineInput,
    #[error("enriched context not found")]
    MissingContext,
    #[error("no artifacts to shelve")]
    NoArtifacts,
}

impl PrereqError {
    /// The command that would produce the missing artifact, if one exists.
    pub fn hint(&self, job_id: &str) -> Option<String> {
        match self {
            PrereqError::FileMissing { .. } | PrereqError::FileEmpty { .. } => None,
            PrereqError::MissingIngest => Some(format!(
                "run: scrivano jobs retry {} --from-stage ingest",
                job_id
            )),
            PrereqError::MissingRefineInput => {
                Some(format!("run: scrivano scribe {}", job_id))
            }
            PrereqError::MissingContext => Some(format!("run: scrivano refine {}", job_id)),
            PrereqError::NoArtifacts => Some(format!("run: scrivano generate {}", job_id)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageFailureCause {
    #[error("{0}")]
    Prerequisite(#[from] PrereqError),
    #[error("{0}")]
    Transcription(#[from] TranscriptionError),
    #[error("{0}")]
    Refinement(#[from] RefinementError),
    #[error("{0}")]
    Media(#[from] MediaToolError),
    #[error("{0}")]
    Render(#[from] RenderError),
    #[error("{0}")]
    Template(#[from] TemplateError),
    #[error("{0}")]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("stage timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StageFailureCause {
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            StageFailureCause::Cancelled
                | StageFailureCause::Transcription(TranscriptionError::Cancelled)
                | StageFailureCause::Refinement(RefinementError::Cancelled)
        )
    }
}

/// Provider-layer failures are wrapped with the stage, provider, and model
/// before they reach the driver.
#[derive(Debug, thiserror::Error)]
#[error("stage {stage} failed{}: {cause}", provider_suffix(.provider, .model))]
pub struct StageError {
    pub stage: StageName,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub cause: StageFailureCause,
}

fn provider_suffix(provider: &Option<String>, model: &Option<String>) -> String {
    match (provider, model) {
        (Some(p), Some(m)) => format!(" ({}/{})", p, m),
        (Some(p), None) => format!(" ({})", p),
        _ => String::new(),
    }
}

impl StageError {
    pub fn plain(stage: StageName, cause: impl Into<StageFailureCause>) -> Self {
        StageError {
            stage,
            provider: None,
            model: None,
            cause: cause.into(),
        }
    }

    pub fn with_binding(
        stage: StageName,
        provider: &str,
        model: &str,
        cause: impl Into<StageFailureCause>,
    ) -> Self {
        StageError {
            stage,
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            cause: cause.into(),
        }
    }
}

/// What a completed stage hands back to the driver: a request/response
/// summary for `_stages/<stage>.json` plus its usage record, if the stage
/// made billed calls.
pub struct StageRecord {
    pub summary: serde_json::Value,
    pub usage: Option<UsageRecord>,
}

impl StageRecord {
    pub fn new(summary: serde_json::Value) -> Self {
        StageRecord {
            summary,
            usage: None,
        }
    }

    pub fn with_usage(summary: serde_json::Value, usage: UsageRecord) -> Self {
        StageRecord {
            summary,
            usage: Some(usage),
        }
    }
}

/// One pipeline stage: a function over the job and external services, with
/// side effects confined to the job directory and the provider calls it
/// makes. Stages are independently restartable.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn name(&self) -> StageName;

    async fn validate_prerequisites(&self, job: &Job) -> Result<(), PrereqError>;

    async fn execute(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> Result<StageRecord, StageError>;
}

/// Orchestrates stage execution over a job: strict stage ordering,
/// prerequisite validation, `stop_after` handling, and state persistence
/// around every transition.
pub struct PipelineDriver {
    store: Arc<dyn JobStore>,
    executors: Vec<Arc<dyn StageExecutor>>,
}

impl PipelineDriver {
    pub fn new(store: Arc<dyn JobStore>, executors: Vec<Arc<dyn StageExecutor>>) -> Self {
        PipelineDriver { store, executors }
    }

    fn executor(&self, stage: StageName) -> Option<&Arc<dyn StageExecutor>> {
        self.executors.iter().find(|e| e.name() == stage)
    }

    /// Execute stages `from` through `stop_after` inclusive. Returns whether
    /// the run completed SHELVE (and so should be finalized). On a stage
    /// failure the error is persisted and returned; later stages stay
    /// pending.
    pub async fn execute(
        &self,
        job: &mut Job,
        from: StageName,
        stop_after: StageName,
        cancel: &CancellationToken,
    ) -> Result<bool, StageError> {
        let mut reached_shelve = false;

        for stage in from.span(stop_after) {
            if job.state.stage(stage).status.is_settled() {
                tracing::debug!(job_id = %job.id, stage = %stage, "stage already settled, skipping");
                if stage == StageName::Shelve {
                    reached_shelve = true;
                }
                continue;
            }

            let executor = match self.executor(stage) {
                Some(executor) => executor,
                None => {
                    let err = StageError::plain(
                        stage,
                        StoreError::Corrupt {
                            path: String::new(),
                            message: format!("no executor registered for stage {}", stage),
                        },
                    );
                    self.record_failure(job, stage, &err, None).await;
                    return Err(err);
                }
            };

            if stage == StageName::Scribe && job.meta.configuration.skip_transcript {
                tracing::info!(job_id = %job.id, "direct mode: skipping scribe stage");
                job.state.mark_skipped(stage, Utc::now());
                self.persist(job).await;
                continue;
            }

            if cancel.is_cancelled() {
                let err = StageError::plain(stage, StageFailureCause::Cancelled);
                self.record_failure(job, stage, &err, None).await;
                return Err(err);
            }

            if let Err(prereq) = executor.validate_prerequisites(job).await {
                let hint = prereq.hint(job.id.as_str());
                let err = StageError::plain(stage, prereq);
                tracing::error!(
                    job_id = %job.id,
                    stage = %stage,
                    error = %err,
                    hint = hint.as_deref().unwrap_or(""),
                    "prerequisite validation failed"
                );
                self.record_failure(job, stage, &err, hint).await;
                return Err(err);
            }

            tracing::info!(job_id = %job.id, stage = %stage, "stage started");
            job.state.mark_running(stage, Utc::now());
            self.persist(job).await;

            let timeout = stage_timeout(job, stage);
            let result = match timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, executor.execute(job, cancel)).await {
                        Ok(result) => result,
                        Err(_) => Err(StageError::plain(stage, StageFailureCause::Timeout)),
                    }
                }
                None => executor.execute(job, cancel).await,
            };

            match result {
                Ok(record) => {
                    let now = Utc::now();
                    if let Some(usage) = &record.usage {
                        job.meta.processing.record(usage);
                    }
                    job.meta.processing.mark_stage_completed(stage);
                    job.meta.updated_at = now;
                    self.write_stage_record(job, stage, &record);
                    job.state.mark_completed(stage, now);
                    self.persist(job).await;
                    tracing::info!(job_id = %job.id, stage = %stage, "stage completed");
                    if stage == StageName::Shelve {
                        reached_shelve = true;
                    }
                }
                Err(err) => {
                    self.record_failure(job, stage, &err, None).await;
                    return Err(err);
                }
            }
        }

        Ok(reached_shelve)
    }

    async fn record_failure(
        &self,
        job: &mut Job,
        stage: StageName,
        err: &StageError,
        hint: Option<String>,
    ) {
        let now = Utc::now();
        let cause = if err.cause.is_cancellation() {
            "cancelled".to_string()
        } else {
            err.to_string()
        };
        job.state.mark_failed(stage, cause.clone(), now);
        job.meta.updated_at = now;

        let mut record = json!({
            "stage": stage.as_str(),
            "failed_at": now.to_rfc3339(),
            "error": cause,
            "provider": err.provider,
            "model": err.model,
        });
        if let Some(hint) = hint {
            record["hint"] = json!(hint);
        }
        // Failure records go beside the stage's regular record so retries
        // keep the full history visible.
        let path = job
            .stages_dir()
            .join(format!("{}.failure.json", stage.as_str()));
        if let Err(e) = write_json_atomic(&path, &record) {
            tracing::warn!(job_id = %job.id, error = %e, "could not write failure record");
        }

        self.persist(job).await;
        tracing::error!(job_id = %job.id, stage = %stage, error = %err, "stage failed");
    }

    fn write_stage_record(&self, job: &Job, stage: StageName, record: &StageRecord) {
        let mut value = record.summary.clone();
        if !value.is_object() {
            value = json!({ "result": value });
        }
        value["stage"] = json!(stage.as_str());
        value["completed_at"] = json!(Utc::now().to_rfc3339());
        if let Some(usage) = &record.usage {
            value["usage"] = serde_json::to_value(usage).unwrap_or_default();
        }
        if let Err(e) = write_json_atomic(&job.stage_record_path(stage), &value) {
            tracing::warn!(job_id = %job.id, stage = %stage, error = %e, "could not write stage record");
        }
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save(job).await {
            tracing::error!(job_id = %job.id, error = %e, "could not persist job state");
        }
    }
}

/// Provider-call stages honor the configured stage-level timeout; a retry
/// inside the stage does not reset it.
fn stage_timeout(job: &Job, stage: StageName) -> Option<std::time::Duration> {
    match stage {
        StageName::Scribe | StageName::Refine => job
            .meta
            .configuration
            .scribe
            .timeout_seconds
            .map(std::time::Duration::from_secs),
        _ => None,
    }
}
