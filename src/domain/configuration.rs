use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How INGEST prepares the media before handing it to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Copy the source untouched.
    Original,
    /// Transcode to 24 kbps mono Opus in an Ogg container.
    Compressed,
    /// Compressed plus silence trimming.
    Optimized,
}

impl FromStr for CompressionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(CompressionMode::Original),
            "compressed" => Ok(CompressionMode::Compressed),
            "optimized" => Ok(CompressionMode::Optimized),
            other => Err(format!("unknown compression mode: {}", other)),
        }
    }
}

impl std::fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompressionMode::Original => "original",
            CompressionMode::Compressed => "compressed",
            CompressionMode::Optimized => "optimized",
        };
        write!(f, "{}", s)
    }
}

/// Where and under what names SHELVE places finalized artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShelveStrategy {
    /// `<results>/<YYYY>/<MM>/<DD>/<job_id>/`.
    Timeline,
    /// Flat results directory with pattern-renamed artifacts.
    Flat,
    /// Flat plus tag-based routing into topic subdirectories.
    Zettelkasten,
}

impl FromStr for ShelveStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeline" => Ok(ShelveStrategy::Timeline),
            "flat" => Ok(ShelveStrategy::Flat),
            "zettelkasten" => Ok(ShelveStrategy::Zettelkasten),
            other => Err(format!("unknown shelve strategy: {}", other)),
        }
    }
}

/// Renaming and routing rules for the flat and zettelkasten strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZettelkastenRules {
    /// `chrono` format string rendered into `{id}`.
    #[serde(default = "default_id_format")]
    pub id_format: String,
    /// Pattern over `{id}`, `{slug}`, `{date}`, `{title}`.
    #[serde(default = "default_filename_pattern")]
    pub filename_pattern: String,
    /// Maps values of enriched-context fields to destination subdirectories.
    /// Jobs matching no route land in `Inbox/`.
    #[serde(default)]
    pub tag_routes: BTreeMap<String, String>,
}

fn default_id_format() -> String {
    "%Y%m%d%H%M".to_string()
}

fn default_filename_pattern() -> String {
    "{id} {slug}".to_string()
}

impl Default for ZettelkastenRules {
    fn default() -> Self {
        ZettelkastenRules {
            id_format: default_id_format(),
            filename_pattern: default_filename_pattern(),
            tag_routes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShelveConfig {
    pub strategy: ShelveStrategy,
    #[serde(default)]
    pub zettelkasten: ZettelkastenRules,
}

impl Default for ShelveConfig {
    fn default() -> Self {
        ShelveConfig {
            strategy: ShelveStrategy::Timeline,
            zettelkasten: ZettelkastenRules::default(),
        }
    }
}

/// Provider and model selection for one API-backed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBinding {
    pub provider: String,
    pub model: String,
}

/// Bounded in-stage retries with linearly growing delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Stage-level provider call timeout; absent means no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

fn default_retry_max() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retry_max: default_retry_max(),
            retry_delay_seconds: default_retry_delay(),
            timeout_seconds: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based); grows linearly.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_delay_seconds * attempt as u64)
    }
}

/// One requested output: a renderer plugin, a template it owns, and an
/// optional filename override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub plugin: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Configuration snapshot frozen into `meta.json` at job creation.
/// Later edits to the process-level settings never affect a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
    /// Language hint, or "auto".
    pub language: String,
    pub compression_mode: CompressionMode,
    pub transcribe: StageBinding,
    pub refine: StageBinding,
    #[serde(default)]
    pub scribe: RetryPolicy,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    pub shelve: ShelveConfig,
    /// Direct mode: REFINE runs against the audio handle, SCRIBE is skipped.
    #[serde(default)]
    pub skip_transcript: bool,
    #[serde(default)]
    pub debug: bool,
}

impl JobConfiguration {
    pub fn language_hint(&self) -> Option<&str> {
        if self.language == "auto" {
            None
        } else {
            Some(&self.language)
        }
    }
}
