mod media;
mod refinement;
mod renderer;
mod store;
mod transcription;

pub use media::{MediaInfo, MediaTool, MediaToolError};
pub use refinement::{RefineInput, Refinement, RefinementError, RefinementProvider};
pub use renderer::{RenderError, RenderedArtifact, Renderer};
pub use store::{JobFilter, JobStore, StoreError};
pub use transcription::{
    IngestSpecs, SegmentEvent, SegmentStream, Transcription, TranscriptionError,
    TranscriptionProvider, UpstreamMedia,
};
