use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::application::ports::MediaTool;
use crate::domain::{CompressionMode, IngestResult, Job, StageName};
use crate::infrastructure::providers::ProviderRegistry;

use super::{PrereqError, StageError, StageExecutor, StageRecord};

/// Media longer than this is uploaded to the provider's upstream cache when
/// the provider exposes one; shorter media is sent inline.
const UPSTREAM_CACHE_THRESHOLD_SECONDS: f64 = 300.0;

const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "mov", "mkv", "webm"];

/// INGEST: probe, compress, and register the media with the configured
/// transcription provider.
pub struct IngestStage {
    media: Arc<dyn MediaTool>,
    providers: Arc<ProviderRegistry>,
}

impl IngestStage {
    pub fn new(media: Arc<dyn MediaTool>, providers: Arc<ProviderRegistry>) -> Self {
        IngestStage { media, providers }
    }
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let ext = e.to_string_lossy().to_lowercase();
            VIDEO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[async_trait]
impl StageExecutor for IngestStage {
    fn name(&self) -> StageName {
        StageName::Ingest
    }

    async fn validate_prerequisites(&self, job: &Job) -> Result<(), PrereqError> {
        // The working copy made at creation is authoritative; the original
        // source may legitimately be gone by continuation time.
        let candidate = job
            .working_copy()
            .unwrap_or_else(|| PathBuf::from(&job.meta.source));

        let metadata = std::fs::metadata(&candidate)
            .map_err(|_| PrereqError::FileMissing {
                path: candidate.clone(),
            })?;
        if metadata.len() == 0 {
            return Err(PrereqError::FileEmpty { path: candidate });
        }
        Ok(())
    }

    async fn execute(
        &self,
        job: &mut Job,
        _cancel: &CancellationToken,
    ) -> Result<StageRecord, StageError> {
        let config = job.meta.configuration.clone();
        let stage = StageName::Ingest;

        let working_copy = job.working_copy().ok_or_else(|| {
            StageError::plain(
                stage,
                PrereqError::FileMissing {
                    path: job.media_dir().join("original.*"),
                },
            )
        })?;

        let info = self
            .media
            .probe(&working_copy)
            .await
            .map_err(|e| StageError::plain(stage, e))?;
        tracing::info!(
            job_id = %job.id,
            duration_seconds = info.duration_seconds,
            format = %info.format,
            bitrate = info.bitrate,
            "probed media"
        );

        job.meta.media.duration_seconds = Some(info.duration_seconds);
        job.meta.media.format = Some(info.format.clone());
        job.meta.media.bitrate = Some(info.bitrate);
        job.meta.media.file_size_bytes = Some(info.file_size_bytes);

        // Video containers always transcode; audio follows the configured mode.
        let needs_conversion = is_video(&working_copy)
            || matches!(
                config.compression_mode,
                CompressionMode::Compressed | CompressionMode::Optimized
            );

        let compressed_path = if needs_conversion {
            let output = job.media_dir().join("compressed.ogg");
            let trim_silence = config.compression_mode == CompressionMode::Optimized;
            self.media
                .transcode_opus(&working_copy, &output, trim_silence)
                .await
                .map_err(|e| StageError::plain(stage, e))?;
            Some(output)
        } else {
            None
        };

        let mut result = IngestResult {
            source_path: PathBuf::from(&job.meta.source),
            working_copy_path: working_copy,
            compressed_path,
            duration_seconds: info.duration_seconds,
            format: info.format,
            bitrate: info.bitrate,
            file_size_bytes: info.file_size_bytes,
            upstream_cache_handle: None,
            uploaded_uri: None,
        };

        let provider = self
            .providers
            .get_transcription(&config.transcribe.provider, &config.transcribe.model)
            .map_err(|e| StageError::plain(stage, e))?;
        let specs = provider.ingest_specs();

        if specs.needs_upstream_cache
            && info.duration_seconds >= UPSTREAM_CACHE_THRESHOLD_SECONDS
        {
            let upload_source = result.upload_source().clone();
            let upstream = provider
                .prepare_upstream(&upload_source, info.duration_seconds)
                .await
                .map_err(|e| {
                    StageError::with_binding(
                        stage,
                        &config.transcribe.provider,
                        &config.transcribe.model,
                        e,
                    )
                })?;
            if let Some(upstream) = upstream {
                tracing::info!(
                    job_id = %job.id,
                    cached = upstream.cache_handle.is_some(),
                    "registered media upstream"
                );
                result.upstream_cache_handle = upstream.cache_handle;
                result.uploaded_uri = Some(upstream.uri);
            }
        }

        let summary = serde_json::to_value(&result).map_err(|e| {
            StageError::plain(stage, crate::application::ports::StoreError::Serialize(e))
        })?;
        Ok(StageRecord::new(summary))
    }
}
