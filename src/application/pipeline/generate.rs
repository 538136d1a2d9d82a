use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::domain::{EnrichedContext, Job, StageName, TranscriptSegment};
use crate::infrastructure::render::RendererRegistry;
use crate::infrastructure::store::read_json_with_retry;
use crate::infrastructure::templates::TemplateRegistry;

use super::{PrereqError, StageError, StageExecutor, StageFailureCause, StageRecord};

/// GENERATE: render every configured artifact from the enriched context and
/// (where a plugin needs it) the raw transcript. Artifacts whose declared
/// inputs are missing are skipped with a recorded reason.
pub struct GenerateStage {
    templates: Arc<TemplateRegistry>,
    renderers: Arc<RendererRegistry>,
}

impl GenerateStage {
    pub fn new(templates: Arc<TemplateRegistry>, renderers: Arc<RendererRegistry>) -> Self {
        GenerateStage {
            templates,
            renderers,
        }
    }
}

#[async_trait]
impl StageExecutor for GenerateStage {
    fn name(&self) -> StageName {
        StageName::Generate
    }

    async fn validate_prerequisites(&self, job: &Job) -> Result<(), PrereqError> {
        if !job.enriched_context_path().is_file() {
            return Err(PrereqError::MissingContext);
        }
        Ok(())
    }

    async fn execute(
        &self,
        job: &mut Job,
        _cancel: &CancellationToken,
    ) -> Result<StageRecord, StageError> {
        let stage = StageName::Generate;
        let config = job.meta.configuration.clone();

        let context: EnrichedContext = read_json_with_retry(&job.enriched_context_path())
            .map_err(|e| StageError::plain(stage, e))?;
        let transcript: Option<Vec<TranscriptSegment>> =
            read_json_with_retry(&job.raw_transcript_path()).ok();

        tokio::fs::create_dir_all(job.artifacts_dir())
            .await
            .map_err(|e| {
                StageError::plain(
                    stage,
                    StageFailureCause::Io {
                        path: job.artifacts_dir().display().to_string(),
                        source: e,
                    },
                )
            })?;

        let mut generated: Vec<serde_json::Value> = Vec::new();
        let mut skipped: Vec<serde_json::Value> = Vec::new();

        for artifact in &config.artifacts {
            let Some(renderer) = self.renderers.get(&artifact.plugin) else {
                tracing::warn!(
                    job_id = %job.id,
                    plugin = %artifact.plugin,
                    "renderer plugin not registered, skipping artifact"
                );
                skipped.push(json!({
                    "plugin": artifact.plugin,
                    "template": artifact.template,
                    "reason": "UnknownRenderer",
                }));
                continue;
            };

            if renderer.needs_transcript() && transcript.is_none() {
                tracing::warn!(
                    job_id = %job.id,
                    plugin = %artifact.plugin,
                    "no raw transcript available, skipping artifact"
                );
                skipped.push(json!({
                    "plugin": artifact.plugin,
                    "template": artifact.template,
                    "reason": "NoTranscriptForSubtitles",
                }));
                continue;
            }

            let template = self
                .templates
                .lookup(&artifact.plugin, &artifact.template)
                .map_err(|e| StageError::plain(stage, e))?;

            let rendered = renderer
                .render(&template.body, &context, transcript.as_deref())
                .map_err(|e| StageError::plain(stage, e))?;

            let filename = match (&artifact.filename, &rendered.suggested_filename) {
                (Some(override_name), _) => {
                    format!("{}.{}", override_name, renderer.extension())
                }
                (None, Some(suggested)) => suggested.clone(),
                (None, None) => format!("{}.{}", artifact.template, renderer.extension()),
            };

            let output_path = job.artifacts_dir().join(&filename);
            tokio::fs::write(&output_path, &rendered.bytes)
                .await
                .map_err(|e| {
                    StageError::plain(
                        stage,
                        StageFailureCause::Io {
                            path: output_path.display().to_string(),
                            source: e,
                        },
                    )
                })?;

            tracing::info!(
                job_id = %job.id,
                plugin = %artifact.plugin,
                template = %artifact.template,
                file = %filename,
                "rendered artifact"
            );
            generated.push(json!({
                "plugin": artifact.plugin,
                "template": artifact.template,
                "file": filename,
            }));
        }

        if generated.is_empty() {
            tracing::warn!(job_id = %job.id, "no artifacts were generated");
        }

        Ok(StageRecord::new(json!({
            "generated": generated,
            "skipped": skipped,
        })))
    }
}
