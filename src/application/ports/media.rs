use std::path::Path;

use async_trait::async_trait;

/// Container facts reported by the probing tool.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub format: String,
    pub bitrate: u64,
    pub file_size_bytes: u64,
}

/// The external media tool contract: probing and speech-oriented
/// transcoding. Audio encoding itself is delegated; this crate never
/// touches samples.
#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaToolError>;

    /// Transcode to 24 kbps mono Opus in an Ogg container, optionally
    /// trimming silence.
    async fn transcode_opus(
        &self,
        input: &Path,
        output: &Path,
        trim_silence: bool,
    ) -> Result<(), MediaToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MediaToolError {
    #[error("media tool not available: {0}")]
    ToolMissing(String),
    #[error("probe failed for {path}: {message}")]
    ProbeFailed { path: String, message: String },
    #[error("transcode failed for {path}: {message}")]
    TranscodeFailed { path: String, message: String },
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
