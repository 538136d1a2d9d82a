use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::application::pipeline::{
    GenerateStage, IngestStage, PipelineDriver, RefineStage, ScribeStage, ShelveStage,
    StageExecutor, StageFailureCause,
};
use crate::application::ports::{JobFilter, StoreError};
use crate::application::{JobManager, ManagerError, StageError, UsageReporter};
use crate::domain::{Job, JobConfiguration, JobStatus, StageName};
use crate::infrastructure::media::FfmpegTool;
use crate::infrastructure::providers::{ProviderRegistry, RegistryError};
use crate::infrastructure::render::RendererRegistry;
use crate::infrastructure::store::FsJobStore;
use crate::infrastructure::templates::{TemplateError, TemplateRegistry};
use crate::infrastructure::watch::{Watcher, WatcherSettings};

use super::cli::{Commands, JobsCommand};
use super::settings::Settings;

/// Exit codes: 0 success, 1 user error, 2 internal failure.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    User(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::User(_) => 1,
            AppError::Internal(_) => 2,
        }
    }
}

impl From<ManagerError> for AppError {
    fn from(e: ManagerError) -> Self {
        match &e {
            ManagerError::NoJobs => AppError::User(e.to_string()),
            ManagerError::Template(
                TemplateError::NotFound { .. } | TemplateError::SchemaConflict { .. },
            ) => AppError::User(e.to_string()),
            ManagerError::Store(StoreError::NotFound(_) | StoreError::SourceMissing(_)) => {
                AppError::User(e.to_string())
            }
            _ => AppError::Internal(e.into()),
        }
    }
}

impl From<StageError> for AppError {
    fn from(e: StageError) -> Self {
        match &e.cause {
            StageFailureCause::Prerequisite(_) => AppError::User(e.to_string()),
            StageFailureCause::Registry(
                RegistryError::UnknownProvider(_)
                | RegistryError::MissingApiKey { .. }
                | RegistryError::MissingCapability { .. },
            ) => AppError::User(e.to_string()),
            StageFailureCause::Template(
                TemplateError::NotFound { .. } | TemplateError::SchemaConflict { .. },
            ) => AppError::User(e.to_string()),
            _ => AppError::Internal(e.into()),
        }
    }
}

/// Wires settings into the engine: store, registries, stage executors,
/// driver, manager, reporter.
pub struct App {
    settings: Settings,
    manager: Arc<JobManager>,
    driver: Arc<PipelineDriver>,
    reporter: UsageReporter,
}

impl App {
    pub fn build(settings: Settings) -> Result<Self, AppError> {
        let store = Arc::new(
            FsJobStore::new(&settings.paths.work)
                .map_err(|e| AppError::Internal(e.into()))?,
        );
        let providers = Arc::new(
            ProviderRegistry::discover(&settings.paths.providers)
                .map_err(|e| AppError::User(format!("provider discovery failed: {}", e)))?,
        );
        let templates = Arc::new(
            TemplateRegistry::load(&settings.paths.templates)
                .map_err(|e| AppError::User(format!("template discovery failed: {}", e)))?,
        );
        let renderers = Arc::new(RendererRegistry::with_builtins());
        let media = Arc::new(FfmpegTool::new());

        let executors: Vec<Arc<dyn StageExecutor>> = vec![
            Arc::new(IngestStage::new(media, Arc::clone(&providers))),
            Arc::new(ScribeStage::new(Arc::clone(&providers))),
            Arc::new(RefineStage::new(
                Arc::clone(&providers),
                Arc::clone(&templates),
            )),
            Arc::new(GenerateStage::new(Arc::clone(&templates), renderers)),
            Arc::new(ShelveStage::new(
                Arc::clone(&providers),
                &settings.paths.results,
            )),
        ];

        let driver = Arc::new(PipelineDriver::new(
            store.clone() as Arc<dyn crate::application::ports::JobStore>,
            executors,
        ));
        let manager = Arc::new(JobManager::new(
            store.clone() as Arc<dyn crate::application::ports::JobStore>,
            templates,
            &settings.paths.results,
        ));
        let reporter =
            UsageReporter::new(store as Arc<dyn crate::application::ports::JobStore>);

        Ok(App {
            settings,
            manager,
            driver,
            reporter,
        })
    }

    pub async fn dispatch(&self, command: Commands) -> Result<(), AppError> {
        let cancel = cancellation_on_ctrl_c();

        match command {
            Commands::Run {
                source,
                stop_after,
                skip_transcript,
                compression_mode,
                model,
                shelve_mode,
            } => {
                let mut configuration = self.settings.job_configuration();
                configuration.skip_transcript = skip_transcript;
                if let Some(mode) = compression_mode {
                    configuration.compression_mode = mode;
                }
                if let Some(model) = model {
                    configuration.transcribe.model = model;
                }
                if let Some(strategy) = shelve_mode {
                    configuration.shelve.strategy = strategy;
                }
                self.start_job(&source, configuration, stop_after, &cancel)
                    .await
            }
            Commands::Ingest { source, stop_after } => {
                let configuration = self.settings.job_configuration();
                self.start_job(&source, configuration, stop_after, &cancel)
                    .await
            }
            Commands::Scribe { id, stop_after } => {
                self.continue_job(id, StageName::Scribe, stop_after, &cancel)
                    .await
            }
            Commands::Refine { id, stop_after } => {
                self.continue_job(id, StageName::Refine, stop_after, &cancel)
                    .await
            }
            Commands::Generate { id, stop_after } => {
                self.continue_job(id, StageName::Generate, stop_after, &cancel)
                    .await
            }
            Commands::Shelve { id, stop_after } => {
                self.continue_job(id, StageName::Shelve, stop_after, &cancel)
                    .await
            }
            Commands::Jobs { command } => self.jobs(command, &cancel).await,
            Commands::Watch => self.watch(cancel).await,
            Commands::Report { days } => {
                let summary = self
                    .reporter
                    .summarize(days)
                    .await
                    .map_err(|e| AppError::Internal(e.into()))?;
                println!("{}", summary);
                Ok(())
            }
        }
    }

    async fn start_job(
        &self,
        source: &Path,
        configuration: JobConfiguration,
        stop_after: Option<StageName>,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let stop_after = stop_after.unwrap_or(StageName::Shelve);
        let mut job = self.manager.create_job(source, configuration).await?;
        println!("{}", job.id);

        self.execute(&mut job, StageName::Ingest, stop_after, cancel)
            .await
    }

    async fn continue_job(
        &self,
        id: Option<String>,
        from: StageName,
        stop_after: Option<StageName>,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let stop_after = stop_after.unwrap_or(StageName::Shelve);
        let mut job = self.manager.resolve(id.as_deref()).await?;
        self.manager.reset_from(&mut job, from).await?;
        self.execute(&mut job, from, stop_after, cancel).await
    }

    async fn execute(
        &self,
        job: &mut Job,
        from: StageName,
        stop_after: StageName,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let reached_shelve = match self.driver.execute(job, from, stop_after, cancel).await {
            Ok(reached_shelve) => reached_shelve,
            Err(e) => {
                if let StageFailureCause::Prerequisite(prereq) = &e.cause {
                    if let Some(hint) = prereq.hint(job.id.as_str()) {
                        eprintln!("hint: {}", hint);
                    }
                }
                return Err(AppError::from(e));
            }
        };

        if reached_shelve {
            self.manager.finalize(job).await?;
            println!("completed: {}", job.id);
        } else {
            println!("stopped after {}: {}", stop_after, job.id);
        }
        Ok(())
    }

    async fn jobs(&self, command: JobsCommand, cancel: &CancellationToken) -> Result<(), AppError> {
        match command {
            JobsCommand::List { status, since } => {
                let filter = JobFilter {
                    status: parse_status(status.as_deref())?,
                    since: since.map(|days| Utc::now() - Duration::days(days)),
                };
                let jobs = self.manager.list(&filter).await?;
                for job in jobs {
                    let detail = job
                        .state
                        .failed_stage()
                        .map(|s| format!(" (failed at {})", s))
                        .or_else(|| {
                            job.state
                                .first_unsettled()
                                .map(|s| format!(" (next: {})", s))
                        })
                        .unwrap_or_default();
                    println!(
                        "{}  {:<9}  {}{}",
                        job.id,
                        job.state.status,
                        job.state.updated_at.format("%Y-%m-%d %H:%M:%S"),
                        detail
                    );
                }
                Ok(())
            }
            JobsCommand::Show { id } => {
                let job = self.manager.load(&id).await?;
                let state = serde_json::to_string_pretty(&job.state)
                    .map_err(|e| AppError::Internal(e.into()))?;
                let processing = serde_json::to_string_pretty(&job.meta.processing)
                    .map_err(|e| AppError::Internal(e.into()))?;
                println!("{}", state);
                println!("{}", processing);
                Ok(())
            }
            JobsCommand::Retry { id, from_stage } => {
                let mut job = self.manager.load(&id).await?;
                let from = from_stage.unwrap_or_else(|| self.manager.default_retry_stage(&job));
                self.manager.reset_from(&mut job, from).await?;
                self.execute(&mut job, from, StageName::Shelve, cancel).await
            }
            JobsCommand::Cleanup { older_than, status } => {
                let status = parse_status(status.as_deref())?;
                let removed = match older_than {
                    Some(days) => self.manager.cleanup(days, status).await?,
                    None => {
                        let cleanup = &self.settings.cleanup;
                        self.manager
                            .cleanup(cleanup.failed_jobs_retention_days, Some(JobStatus::Failed))
                            .await?
                            + self
                                .manager
                                .cleanup(
                                    cleanup.completed_jobs_retention_days,
                                    Some(JobStatus::Completed),
                                )
                                .await?
                    }
                };
                println!("removed {} job(s)", removed);
                Ok(())
            }
            JobsCommand::Delete { id } => {
                self.manager.delete(&id).await?;
                println!("deleted: {}", id);
                Ok(())
            }
            JobsCommand::Finalize { id } => {
                let mut job = self.manager.load(&id).await?;
                let destination = self.manager.finalize_with_placement(&mut job).await?;
                println!("finalized to {}", destination.display());
                Ok(())
            }
        }
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<(), AppError> {
        if self.settings.cleanup.auto_cleanup_enabled {
            let cleanup = &self.settings.cleanup;
            let removed = self
                .manager
                .cleanup(cleanup.failed_jobs_retention_days, Some(JobStatus::Failed))
                .await?
                + self
                    .manager
                    .cleanup(
                        cleanup.completed_jobs_retention_days,
                        Some(JobStatus::Completed),
                    )
                    .await?;
            if removed > 0 {
                tracing::info!(removed, "auto-cleanup removed old jobs");
            }
        }

        let watcher = Watcher::new(
            &self.settings.paths.input,
            Arc::clone(&self.manager),
            Arc::clone(&self.driver),
            self.settings.job_configuration(),
            WatcherSettings {
                debounce_seconds: self.settings.watch.debounce_seconds,
                poll_interval_seconds: self.settings.watch.poll_interval_seconds,
            },
        );
        watcher
            .run(cancel)
            .await
            .map_err(|e| AppError::Internal(e.into()))
    }
}

fn parse_status(value: Option<&str>) -> Result<Option<JobStatus>, AppError> {
    match value {
        None => Ok(None),
        Some(s) => s
            .parse::<JobStatus>()
            .map(Some)
            .map_err(AppError::User),
    }
}

fn cancellation_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling current stage");
            child.cancel();
        }
    });
    token
}

/// Append a fatal failure to the process-level error log before exiting
/// non-zero.
pub fn log_fatal(work_dir: &str, error: &AppError) {
    let path = PathBuf::from(work_dir).join("engine-errors.log");
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        let _ = writeln!(file, "{} {}", Utc::now().to_rfc3339(), error);
    }
}
