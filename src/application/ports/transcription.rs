use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::domain::{IngestResult, RetryPolicy, TranscriptSegment, UsageRecord};

/// What the INGEST stage must know about a transcription backend before
/// preparing media for it.
#[derive(Debug, Clone)]
pub struct IngestSpecs {
    pub needs_upstream_cache: bool,
    pub supported_containers: Vec<String>,
    pub accepts_uri: bool,
}

/// Handle to media uploaded ahead of transcription. The cache handle is
/// opaque and provider-scoped.
#[derive(Debug, Clone)]
pub struct UpstreamMedia {
    pub cache_handle: Option<String>,
    pub uri: String,
}

/// Events on the segment stream. The stream is a lazy finite sequence
/// terminated either by an explicit `EndMarker` or by stream close; the
/// consumer must accept both and must never rely on segment counts.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    Segment(TranscriptSegment),
    EndMarker,
}

pub type SegmentStream = BoxStream<'static, Result<SegmentEvent, TranscriptionError>>;

/// A running transcription: the segment stream plus accumulators the
/// backend updates as the stream progresses. Read them only after the
/// stream has been fully consumed.
pub struct Transcription {
    pub segments: SegmentStream,
    pub usage: Arc<Mutex<UsageRecord>>,
    pub detected_language: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for Transcription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcription")
            .field("usage", &self.usage)
            .field("detected_language", &self.detected_language)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for dyn TranscriptionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionProvider").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn ingest_specs(&self) -> IngestSpecs;

    /// Upload media to the provider's upstream cache, if it has one.
    /// Providers without an upstream cache return `Ok(None)`.
    async fn prepare_upstream(
        &self,
        _media: &Path,
        _duration_seconds: f64,
    ) -> Result<Option<UpstreamMedia>, TranscriptionError> {
        Ok(None)
    }

    /// Release previously uploaded media. Best-effort; called during SHELVE.
    async fn release_upstream(&self, _handle: &str) -> Result<(), TranscriptionError> {
        Ok(())
    }

    async fn transcribe(
        &self,
        ingest: &IngestResult,
        language_hint: Option<&str>,
        retry: &RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Transcription, TranscriptionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("api request failed (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("media upload failed: {0}")]
    Upload(String),
    #[error("segment ordering violation: end {end} before start {start}")]
    SegmentOrderingViolation { start: f64, end: f64 },
    #[error("transcription produced no segments")]
    EmptyTranscript,
    #[error("call cancelled")]
    Cancelled,
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TranscriptionError {
    /// Recoverable errors are retried in-stage with linear backoff;
    /// everything else fails the stage immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TranscriptionError::RateLimited(_) | TranscriptionError::Transient(_)
        )
    }
}
