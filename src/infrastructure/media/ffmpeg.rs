use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::application::ports::{MediaInfo, MediaTool, MediaToolError};

/// ffprobe/ffmpeg-backed media tool. Probing reads container metadata;
/// transcoding targets speech: mono Opus at 24 kbps in an Ogg container.
pub struct FfmpegTool {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegTool {
    pub fn new() -> Self {
        FfmpegTool {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }

    pub fn with_binaries(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        FfmpegTool {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

impl Default for FfmpegTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaToolError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration,format_name,bit_rate,size",
                "-of",
                "json",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| MediaToolError::ToolMissing(format!("{}: {}", self.ffprobe, e)))?;

        if !output.status.success() {
            return Err(MediaToolError::ProbeFailed {
                path: path.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let probe: ProbeOutput =
            serde_json::from_slice(&output.stdout).map_err(|e| MediaToolError::ProbeFailed {
                path: path.display().to_string(),
                message: format!("unparseable ffprobe output: {}", e),
            })?;

        let duration_seconds = probe
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);
        let bitrate = probe
            .format
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u64>().ok())
            .unwrap_or(0);
        let file_size_bytes = probe
            .format
            .size
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(MediaInfo {
            duration_seconds,
            format: probe.format.format_name.unwrap_or_default(),
            bitrate,
            file_size_bytes,
        })
    }

    async fn transcode_opus(
        &self,
        input: &Path,
        output: &Path,
        trim_silence: bool,
    ) -> Result<(), MediaToolError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-v", "error", "-i"])
            .arg(input)
            // Strip video and metadata, downmix to mono for speech.
            .args(["-vn", "-map_metadata", "-1", "-ac", "1"]);

        if trim_silence {
            cmd.args([
                "-af",
                "silenceremove=start_periods=1:stop_periods=-1:stop_duration=2:stop_threshold=-45dB",
            ]);
        }

        cmd.args(["-c:a", "libopus", "-b:a", "24k", "-application", "voip"])
            .arg(output);

        let result = cmd
            .output()
            .await
            .map_err(|e| MediaToolError::ToolMissing(format!("{}: {}", self.ffmpeg, e)))?;

        if !result.status.success() {
            return Err(MediaToolError::TranscodeFailed {
                path: input.display().to_string(),
                message: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        tracing::debug!(
            input = %input.display(),
            output = %output.display(),
            trim_silence,
            "transcoded media to ogg/opus"
        );
        Ok(())
    }
}
