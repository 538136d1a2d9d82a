use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::domain::{EnrichedContext, IngestResult, Job, ShelveStrategy, StageName};
use crate::infrastructure::providers::ProviderRegistry;
use crate::infrastructure::store::read_json_with_retry;

use super::{PrereqError, StageError, StageExecutor, StageFailureCause, StageRecord};

/// SHELVE: final placement of artifacts into the results library by the
/// configured strategy, plus best-effort release of the upstream media
/// cache. Copies, never moves; re-running after success is a no-op.
pub struct ShelveStage {
    providers: Arc<ProviderRegistry>,
    results_root: PathBuf,
}

impl ShelveStage {
    pub fn new(providers: Arc<ProviderRegistry>, results_root: impl Into<PathBuf>) -> Self {
        ShelveStage {
            providers,
            results_root: results_root.into(),
        }
    }
}

/// Where a job's artifacts were placed, and under what names.
pub struct Placement {
    pub destination: PathBuf,
    pub files: Vec<String>,
}

/// Apply the configured placement strategy. Shared between the SHELVE stage
/// and `jobs finalize`.
pub fn place_artifacts(job: &Job, results_root: &Path) -> Result<Placement, StageFailureCause> {
    let config = &job.meta.configuration.shelve;
    let context: Option<EnrichedContext> =
        read_json_with_retry(&job.enriched_context_path()).ok();

    let destination = match config.strategy {
        ShelveStrategy::Timeline => results_root
            .join(job.state.created_at.format("%Y/%m/%d").to_string())
            .join(job.id.as_str()),
        ShelveStrategy::Flat => results_root.to_path_buf(),
        ShelveStrategy::Zettelkasten => {
            results_root.join(route_by_tags(context.as_ref(), &config.zettelkasten.tag_routes))
        }
    };

    std::fs::create_dir_all(&destination).map_err(|e| StageFailureCause::Io {
        path: destination.display().to_string(),
        source: e,
    })?;

    let renamed = !matches!(config.strategy, ShelveStrategy::Timeline);
    let base = if renamed {
        Some(render_pattern(
            &config.zettelkasten.filename_pattern,
            &config.zettelkasten.id_format,
            job,
            context.as_ref(),
        ))
    } else {
        None
    };

    let mut files = Vec::new();
    let mut used: HashSet<String> = HashSet::new();
    let artifacts_dir = job.artifacts_dir();
    let entries = std::fs::read_dir(&artifacts_dir).map_err(|e| StageFailureCause::Io {
        path: artifacts_dir.display().to_string(),
        source: e,
    })?;
    let mut sources: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    sources.sort();

    for source in sources {
        let original_name = source
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        let target_name = match &base {
            Some(base) => {
                let extension = source
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default();
                let stem = source
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let candidate = format!("{}.{}", base, extension);
                if used.contains(&candidate) {
                    format!("{} {}.{}", base, stem, extension)
                } else {
                    candidate
                }
            }
            None => original_name.clone(),
        };
        used.insert(target_name.clone());

        let target = destination.join(&target_name);
        std::fs::copy(&source, &target).map_err(|e| StageFailureCause::Io {
            path: target.display().to_string(),
            source: e,
        })?;
        files.push(target_name);
    }

    Ok(Placement { destination, files })
}

/// First context tag with a configured route wins; unrouted jobs go to
/// `Inbox/`.
fn route_by_tags(
    context: Option<&EnrichedContext>,
    routes: &std::collections::BTreeMap<String, String>,
) -> String {
    if let Some(context) = context {
        for field in ["tags", "categories", "topics", "keywords"] {
            let Some(Value::Array(values)) = context.get(field) else {
                continue;
            };
            for value in values {
                if let Some(tag) = value.as_str() {
                    if let Some(subdir) = routes.get(tag) {
                        return subdir.clone();
                    }
                }
            }
        }
    }
    "Inbox".to_string()
}

fn render_pattern(
    pattern: &str,
    id_format: &str,
    job: &Job,
    context: Option<&EnrichedContext>,
) -> String {
    let id = job.state.created_at.format(id_format).to_string();
    let date = job.state.created_at.format("%Y-%m-%d").to_string();
    let title = context
        .and_then(|c| c.get_str("title").map(str::to_string))
        .unwrap_or_else(|| job.id.slug().to_string());

    pattern
        .replace("{id}", &id)
        .replace("{slug}", job.id.slug())
        .replace("{date}", &date)
        .replace("{title}", &title)
}

#[async_trait]
impl StageExecutor for ShelveStage {
    fn name(&self) -> StageName {
        StageName::Shelve
    }

    async fn validate_prerequisites(&self, job: &Job) -> Result<(), PrereqError> {
        let has_artifacts = std::fs::read_dir(job.artifacts_dir())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .any(|e| e.path().is_file())
            })
            .unwrap_or(false);
        if !has_artifacts {
            return Err(PrereqError::NoArtifacts);
        }
        Ok(())
    }

    async fn execute(
        &self,
        job: &mut Job,
        _cancel: &CancellationToken,
    ) -> Result<StageRecord, StageError> {
        let stage = StageName::Shelve;

        let placement =
            place_artifacts(job, &self.results_root).map_err(|e| StageError {
                stage,
                provider: None,
                model: None,
                cause: e,
            })?;

        tracing::info!(
            job_id = %job.id,
            destination = %placement.destination.display(),
            files = placement.files.len(),
            "artifacts shelved"
        );

        // The upstream cache handle is owned by this job; release it now.
        // Best-effort: a stale handle expires on its own.
        if let Ok(ingest) = read_json_with_retry::<IngestResult>(&job.ingest_result_path()) {
            if let Some(handle) = &ingest.upstream_cache_handle {
                let binding = &job.meta.configuration.transcribe;
                match self
                    .providers
                    .get_transcription(&binding.provider, &binding.model)
                {
                    Ok(provider) => {
                        if let Err(e) = provider.release_upstream(handle).await {
                            tracing::warn!(job_id = %job.id, error = %e, "upstream cache release failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "provider unavailable for cache release");
                    }
                }
            }
        }

        Ok(StageRecord::new(json!({
            "strategy": job.meta.configuration.shelve.strategy,
            "destination": placement.destination.display().to_string(),
            "files": placement.files,
        })))
    }
}
