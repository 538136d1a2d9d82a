use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{EnrichedContext, IngestResult, RequiredFields, TranscriptSegment, UsageRecord};

/// Input to a refinement call: either the transcript text or, in direct
/// mode, the ingest handle for the audio itself.
#[derive(Debug, Clone, Copy)]
pub enum RefineInput<'a> {
    Transcript(&'a [TranscriptSegment]),
    Audio(&'a IngestResult),
}

#[derive(Debug)]
pub struct Refinement {
    pub context: EnrichedContext,
    pub usage: UsageRecord,
}

/// Schema-directed structured extraction from text or audio. The provider
/// is called once per job with the assembled schema and must return an
/// object conforming to it.
impl std::fmt::Debug for dyn RefinementProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefinementProvider").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RefinementProvider: Send + Sync {
    async fn refine(
        &self,
        input: RefineInput<'_>,
        schema: &RequiredFields,
        language_hint: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Refinement, RefinementError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RefinementError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("api request failed (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("provider output violates the requested schema: {0}")]
    SchemaViolation(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("direct audio refinement is not supported by this provider")]
    AudioInputUnsupported,
    #[error("call cancelled")]
    Cancelled,
}

impl RefinementError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RefinementError::RateLimited(_) | RefinementError::Transient(_)
        )
    }
}
