use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Output of the INGEST stage, persisted as `_stages/ingest.json`.
///
/// The upstream cache handle is opaque and provider-scoped; it is owned by
/// the job that created it and released best-effort during SHELVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub source_path: PathBuf,
    pub working_copy_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_path: Option<PathBuf>,
    pub duration_seconds: f64,
    pub format: String,
    pub bitrate: u64,
    pub file_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_cache_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_uri: Option<String>,
}

impl IngestResult {
    /// The file a transcription provider should consume: the compressed
    /// rendition when one was produced, otherwise the working copy.
    pub fn upload_source(&self) -> &PathBuf {
        self.compressed_path
            .as_ref()
            .unwrap_or(&self.working_copy_path)
    }
}
