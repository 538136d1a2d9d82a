use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{RefineInput, RefinementError};
use crate::domain::{default_schema, IngestResult, Job, StageName, TranscriptSegment};
use crate::infrastructure::providers::ProviderRegistry;
use crate::infrastructure::store::{read_json_with_retry, write_json_atomic};
use crate::infrastructure::templates::TemplateRegistry;

use super::{PrereqError, StageError, StageExecutor, StageRecord};

/// REFINE: schema-directed structured extraction. Standard mode reads the
/// raw transcript; direct mode points the provider at the audio handle.
pub struct RefineStage {
    providers: Arc<ProviderRegistry>,
    templates: Arc<TemplateRegistry>,
}

impl RefineStage {
    pub fn new(providers: Arc<ProviderRegistry>, templates: Arc<TemplateRegistry>) -> Self {
        RefineStage {
            providers,
            templates,
        }
    }
}

#[async_trait]
impl StageExecutor for RefineStage {
    fn name(&self) -> StageName {
        StageName::Refine
    }

    async fn validate_prerequisites(&self, job: &Job) -> Result<(), PrereqError> {
        if job.meta.configuration.skip_transcript {
            if read_json_with_retry::<IngestResult>(&job.ingest_result_path()).is_err() {
                return Err(PrereqError::MissingRefineInput);
            }
            if job.meta.configuration.language_hint().is_none() {
                // Ungrounded audio analysis without a language hint drifts
                // more easily; proceed, but say so.
                tracing::warn!(
                    job_id = %job.id,
                    "direct mode without an explicit language hint, output language is model-chosen"
                );
            }
            return Ok(());
        }

        if read_json_with_retry::<Vec<TranscriptSegment>>(&job.raw_transcript_path()).is_err() {
            return Err(PrereqError::MissingRefineInput);
        }
        Ok(())
    }

    async fn execute(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> Result<StageRecord, StageError> {
        let stage = StageName::Refine;
        let config = job.meta.configuration.clone();
        let binding = config.refine.clone();

        let schema = {
            let collected = self
                .templates
                .collect_schema(&config.artifacts)
                .map_err(|e| StageError::plain(stage, e))?;
            if collected.is_empty() {
                tracing::debug!(job_id = %job.id, "no template declares fields, using default schema");
                default_schema()
            } else {
                collected
            }
        };

        let provider = self
            .providers
            .get_refinement(&binding.provider, &binding.model)
            .map_err(|e| StageError::plain(stage, e))?;

        // Prefer the explicit hint; fall back to the language SCRIBE detected.
        let detected = job.meta.media.language.clone();
        let language_hint = config
            .language_hint()
            .map(|s| s.to_string())
            .or(detected);

        let transcript: Option<Vec<TranscriptSegment>> = if config.skip_transcript {
            None
        } else {
            Some(
                read_json_with_retry(&job.raw_transcript_path())
                    .map_err(|e| StageError::plain(stage, e))?,
            )
        };
        let ingest: Option<IngestResult> = if config.skip_transcript {
            Some(
                read_json_with_retry(&job.ingest_result_path())
                    .map_err(|e| StageError::plain(stage, e))?,
            )
        } else {
            None
        };

        let mode = if config.skip_transcript { "direct" } else { "standard" };
        let wrap = |cause: RefinementError| {
            StageError::with_binding(stage, &binding.provider, &binding.model, cause)
        };

        // Transient backend errors are retried in-stage under the same
        // bounded linear-backoff policy as transcription.
        let retry = config.scribe.clone();
        let mut attempt: u32 = 0;
        let refinement = loop {
            let input = match (&transcript, &ingest) {
                (Some(segments), _) => RefineInput::Transcript(segments),
                (None, Some(ingest)) => RefineInput::Audio(ingest),
                (None, None) => {
                    return Err(StageError::plain(stage, PrereqError::MissingRefineInput))
                }
            };
            match provider
                .refine(input, &schema, language_hint.as_deref(), cancel.clone())
                .await
            {
                Ok(refinement) => break refinement,
                Err(e) if e.is_recoverable() && attempt < retry.retry_max => {
                    attempt += 1;
                    tracing::warn!(
                        job_id = %job.id,
                        attempt,
                        max = retry.retry_max,
                        error = %e,
                        "recoverable refinement error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(wrap(RefinementError::Cancelled)),
                        _ = tokio::time::sleep(retry.delay_for(attempt)) => {}
                    }
                }
                Err(e) => return Err(wrap(e)),
            }
        };

        let mut context = refinement.context;
        context.stamp_provenance(&binding.provider, &binding.model, language_hint.as_deref());

        if job.meta.media.language.is_none() {
            if let Some(lang) = context.language() {
                job.meta.media.language = Some(lang.to_string());
            }
        }

        write_json_atomic(&job.enriched_context_path(), &context)
            .map_err(|e| StageError::plain(stage, e))?;

        let mut usage = refinement.usage;
        // A retried call is still one billing trail; count every attempt.
        usage.request_count += attempt as u64;

        tracing::info!(
            job_id = %job.id,
            mode,
            fields = schema.len(),
            cost_usd = usage.cost_usd,
            "refinement complete"
        );

        let summary = json!({
            "provider": binding.provider,
            "model": binding.model,
            "mode": mode,
            "schema_fields": schema.keys().cloned().collect::<Vec<_>>(),
        });
        Ok(StageRecord::with_usage(summary, usage))
    }
}
