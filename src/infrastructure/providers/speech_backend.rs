use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    IngestSpecs, SegmentEvent, Transcription, TranscriptionError, TranscriptionProvider,
};
use crate::domain::{IngestResult, RetryPolicy, StageName, TranscriptSegment, UsageRecord};

use super::ProviderDescriptor;

/// Dedicated speech-to-text backend: one multipart request against a
/// transcriptions endpoint returning verbose segment JSON. Transcription
/// capability only; no upstream cache.
pub struct SpeechBackend {
    descriptor: ProviderDescriptor,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl SpeechBackend {
    pub fn new(descriptor: ProviderDescriptor, model: String, api_key: Option<String>) -> Self {
        SpeechBackend {
            descriptor,
            model,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/transcriptions",
            self.descriptor.base_url.trim_end_matches('/')
        )
    }

    async fn request_once(
        &self,
        ingest: &IngestResult,
        language_hint: Option<&str>,
    ) -> Result<VerboseTranscript, TranscriptionError> {
        let media = ingest.upload_source();
        let bytes = tokio::fs::read(media).await.map_err(|e| TranscriptionError::Io {
            path: media.display().to_string(),
            source: e,
        })?;
        let filename = media
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.ogg".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/octet-stream")
            .map_err(|e| TranscriptionError::Upload(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", part);
        if let Some(lang) = language_hint {
            form = form.text("language", lang.to_string());
        }

        let mut request = self.client.post(self.endpoint()).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TranscriptionError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => TranscriptionError::Auth(body),
                429 => TranscriptionError::RateLimited(body),
                500..=599 => TranscriptionError::Transient(format!("status {}: {}", status, body)),
                code => TranscriptionError::Api { status: code, body },
            });
        }

        response
            .json()
            .await
            .map_err(|e| TranscriptionError::MalformedResponse(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct VerboseTranscript {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[async_trait]
impl TranscriptionProvider for SpeechBackend {
    fn ingest_specs(&self) -> IngestSpecs {
        IngestSpecs {
            needs_upstream_cache: false,
            supported_containers: self.descriptor.supported_containers.clone(),
            accepts_uri: self.descriptor.accepts_uri,
        }
    }

    async fn transcribe(
        &self,
        ingest: &IngestResult,
        language_hint: Option<&str>,
        retry: &RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Transcription, TranscriptionError> {
        let started = Instant::now();
        let mut usage = UsageRecord::new(StageName::Scribe, &self.descriptor.name, &self.model);

        let mut attempt: u32 = 0;
        let verbose = loop {
            let call = self.request_once(ingest, language_hint);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TranscriptionError::Cancelled),
                r = call => r,
            };
            match result {
                Ok(verbose) => {
                    usage.request_count += 1;
                    break verbose;
                }
                Err(e) if e.is_recoverable() && attempt < retry.retry_max => {
                    attempt += 1;
                    usage.request_count += 1;
                    tracing::warn!(
                        attempt,
                        max = retry.retry_max,
                        error = %e,
                        "recoverable transcription error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TranscriptionError::Cancelled),
                        _ = tokio::time::sleep(retry.delay_for(attempt)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let detected_language = Arc::new(Mutex::new(verbose.language.clone()));

        let mut segments: Vec<TranscriptSegment> = verbose
            .segments
            .into_iter()
            .map(|s| TranscriptSegment {
                speaker_id: s.speaker.unwrap_or_else(|| "Speaker A".to_string()),
                start_time: s.start,
                end_time: s.end,
                text: s.text.trim().to_string(),
                confidence: s.confidence,
            })
            .collect();
        // Plain-text fallback for minimal servers.
        if segments.is_empty() {
            if let Some(text) = verbose.text.filter(|t| !t.trim().is_empty()) {
                segments.push(TranscriptSegment {
                    speaker_id: "Speaker A".to_string(),
                    start_time: 0.0,
                    end_time: ingest.duration_seconds,
                    text: text.trim().to_string(),
                    confidence: None,
                });
            }
        }

        usage.cost_usd = self.descriptor.table_cost(
            &self.model,
            usage.input_tokens,
            usage.output_tokens,
        );
        usage.duration_seconds = started.elapsed().as_secs_f64();
        let usage = Arc::new(Mutex::new(usage));

        let events: Vec<Result<SegmentEvent, TranscriptionError>> = segments
            .into_iter()
            .map(|s| Ok(SegmentEvent::Segment(s)))
            .chain(std::iter::once(Ok(SegmentEvent::EndMarker)))
            .collect();

        Ok(Transcription {
            segments: futures::stream::iter(events).boxed(),
            usage,
            detected_language,
        })
    }
}
