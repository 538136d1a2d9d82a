use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{SegmentEvent, TranscriptionError};
use crate::domain::{IngestResult, Job, StageName, TranscriptSegment};
use crate::infrastructure::providers::ProviderRegistry;
use crate::infrastructure::store::{read_json_with_retry, write_json_atomic};

use super::{PrereqError, StageError, StageExecutor, StageRecord};

/// SCRIBE: speech-to-text with speaker labels and timestamps. Segments are
/// written incrementally as NDJSON so partial results survive a crash; the
/// complete array lands atomically as `raw_transcript.json`.
pub struct ScribeStage {
    providers: Arc<ProviderRegistry>,
}

impl ScribeStage {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        ScribeStage { providers }
    }
}

#[async_trait]
impl StageExecutor for ScribeStage {
    fn name(&self) -> StageName {
        StageName::Scribe
    }

    async fn validate_prerequisites(&self, job: &Job) -> Result<(), PrereqError> {
        if !job.ingest_result_path().is_file() {
            return Err(PrereqError::MissingIngest);
        }
        Ok(())
    }

    async fn execute(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> Result<StageRecord, StageError> {
        let stage = StageName::Scribe;
        let binding = job.meta.configuration.transcribe.clone();
        let retry = job.meta.configuration.scribe.clone();
        let language_hint = job
            .meta
            .configuration
            .language_hint()
            .map(|s| s.to_string());

        let ingest: IngestResult = read_json_with_retry(&job.ingest_result_path())
            .map_err(|e| StageError::plain(stage, e))?;

        // The source may be gone by continuation time; the working copy is
        // enough to proceed.
        if !ingest.source_path.is_file() && ingest.working_copy_path.is_file() {
            tracing::info!(
                job_id = %job.id,
                source = %ingest.source_path.display(),
                "source media no longer present, continuing from working copy"
            );
        }

        let provider = self
            .providers
            .get_transcription(&binding.provider, &binding.model)
            .map_err(|e| StageError::plain(stage, e))?;

        let wrap = |cause: TranscriptionError| {
            StageError::with_binding(stage, &binding.provider, &binding.model, cause)
        };

        let mut transcription = provider
            .transcribe(&ingest, language_hint.as_deref(), &retry, cancel.clone())
            .await
            .map_err(wrap)?;

        tokio::fs::create_dir_all(job.transcripts_dir())
            .await
            .map_err(|e| {
                StageError::plain(
                    stage,
                    super::StageFailureCause::Io {
                        path: job.transcripts_dir().display().to_string(),
                        source: e,
                    },
                )
            })?;

        let partial_path = job.partial_transcript_path();
        let mut partial = tokio::fs::File::create(&partial_path).await.map_err(|e| {
            StageError::plain(
                stage,
                super::StageFailureCause::Io {
                    path: partial_path.display().to_string(),
                    source: e,
                },
            )
        })?;

        let mut segments: Vec<TranscriptSegment> = Vec::new();

        // Terminate on the first end marker OR stream close, never by
        // counting segments; repeated markers must not re-enter the loop.
        while let Some(event) = transcription.segments.next().await {
            match event.map_err(wrap)? {
                SegmentEvent::Segment(segment) => {
                    if !segment.is_well_ordered() {
                        return Err(wrap(TranscriptionError::SegmentOrderingViolation {
                            start: segment.start_time,
                            end: segment.end_time,
                        }));
                    }
                    let mut line = serde_json::to_vec(&segment)
                        .map_err(|e| wrap(TranscriptionError::MalformedResponse(e.to_string())))?;
                    line.push(b'\n');
                    partial.write_all(&line).await.map_err(|e| {
                        StageError::plain(
                            stage,
                            super::StageFailureCause::Io {
                                path: partial_path.display().to_string(),
                                source: e,
                            },
                        )
                    })?;
                    partial.flush().await.ok();
                    segments.push(segment);
                }
                SegmentEvent::EndMarker => break,
            }
        }
        drop(partial);

        if segments.is_empty() {
            return Err(wrap(TranscriptionError::EmptyTranscript));
        }

        write_json_atomic(&job.raw_transcript_path(), &segments)
            .map_err(|e| StageError::plain(stage, e))?;
        let _ = tokio::fs::remove_file(&partial_path).await;

        let usage = transcription
            .usage
            .lock()
            .map(|u| u.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        let detected_language = transcription
            .detected_language
            .lock()
            .map(|l| l.clone())
            .unwrap_or(None);

        if let Some(lang) = &detected_language {
            job.meta.media.language = Some(lang.clone());
            tracing::info!(job_id = %job.id, language = %lang, "detected language");
        }

        tracing::info!(
            job_id = %job.id,
            segments = segments.len(),
            requests = usage.request_count,
            cost_usd = usage.cost_usd,
            "transcription complete"
        );

        let summary = json!({
            "provider": binding.provider,
            "model": binding.model,
            "segments_count": segments.len(),
            "language": detected_language,
        });
        Ok(StageRecord::with_usage(summary, usage))
    }
}
