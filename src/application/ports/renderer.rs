use crate::domain::{EnrichedContext, TranscriptSegment};

/// Output of a renderer plugin: opaque bytes plus the filename it suggests
/// (the stage falls back to template name + plugin extension).
#[derive(Debug)]
pub struct RenderedArtifact {
    pub bytes: Vec<u8>,
    pub suggested_filename: Option<String>,
}

/// An external rendering plugin, keyed by name. The core treats its output
/// as opaque bytes and never depends on a concrete renderer type.
pub trait Renderer: Send + Sync {
    fn name(&self) -> &str;

    /// Default file extension for artifacts this plugin produces.
    fn extension(&self) -> &str;

    /// Whether rendering requires the raw transcript (subtitles do; a job in
    /// direct mode cannot produce such artifacts).
    fn needs_transcript(&self) -> bool {
        false
    }

    fn render(
        &self,
        template_body: &str,
        context: &EnrichedContext,
        transcript: Option<&[TranscriptSegment]>,
    ) -> Result<RenderedArtifact, RenderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template rendering failed: {0}")]
    Template(String),
    #[error("raw transcript required but not available")]
    TranscriptRequired,
}
