use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::domain::{
    ArtifactSpec, CompressionMode, JobConfiguration, RetryPolicy, ShelveConfig, StageBinding,
};

/// Process-level configuration. Jobs snapshot what they need from here at
/// creation time; later edits never affect running jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub paths: PathsSettings,
    pub processing: ProcessingSettings,
    pub cleanup: CleanupSettings,
    pub watch: WatchSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSettings {
    pub input: String,
    pub work: String,
    pub results: String,
    pub providers: String,
    pub templates: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingSettings {
    pub language: String,
    pub compression_mode: CompressionMode,
    pub debug: bool,
    pub transcribe: StageBinding,
    pub refine: StageBinding,
    #[serde(default)]
    pub scribe: RetryPolicy,
    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    pub shelve: ShelveConfig,
}

fn default_artifacts() -> Vec<ArtifactSpec> {
    vec![ArtifactSpec {
        plugin: "markdown".to_string(),
        template: "summary".to_string(),
        filename: None,
    }]
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSettings {
    pub failed_jobs_retention_days: i64,
    pub completed_jobs_retention_days: i64,
    pub auto_cleanup_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSettings {
    pub debounce_seconds: u64,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Settings {
    /// Load from `scrivano.{yaml,toml,...}` (working directory), an explicit
    /// `--config` file, and `SCRIVANO__`-prefixed environment variables, in
    /// that order of precedence.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("scrivano").required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }

        builder
            .add_source(Environment::default().separator("__").prefix("SCRIVANO"))
            .set_default("paths.input", "./scrivano-in")?
            .set_default("paths.work", "./scrivano-work")?
            .set_default("paths.results", "./scrivano-out")?
            .set_default("paths.providers", "./providers")?
            .set_default("paths.templates", "./templates")?
            .set_default("processing.language", "auto")?
            .set_default("processing.compression_mode", "compressed")?
            .set_default("processing.debug", false)?
            .set_default("processing.transcribe.provider", "aurel")?
            .set_default("processing.transcribe.model", "aurel-swift")?
            .set_default("processing.refine.provider", "aurel")?
            .set_default("processing.refine.model", "aurel-swift")?
            .set_default("processing.scribe.retry_max", 3)?
            .set_default("processing.scribe.retry_delay_seconds", 5)?
            .set_default("cleanup.failed_jobs_retention_days", 7)?
            .set_default("cleanup.completed_jobs_retention_days", 1)?
            .set_default("cleanup.auto_cleanup_enabled", true)?
            .set_default("watch.debounce_seconds", 2)?
            .set_default("watch.poll_interval_seconds", 1)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .build()?
            .try_deserialize()
    }

    /// The job configuration snapshot for a new job, before CLI overrides.
    pub fn job_configuration(&self) -> JobConfiguration {
        JobConfiguration {
            language: self.processing.language.clone(),
            compression_mode: self.processing.compression_mode,
            transcribe: self.processing.transcribe.clone(),
            refine: self.processing.refine.clone(),
            scribe: self.processing.scribe.clone(),
            artifacts: self.processing.artifacts.clone(),
            shelve: self.processing.shelve.clone(),
            skip_transcript: false,
            debug: self.processing.debug,
        }
    }
}
