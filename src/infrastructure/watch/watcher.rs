use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::application::{JobManager, PipelineDriver};
use crate::domain::{JobConfiguration, StageName};

const SUPPORTED_EXTENSIONS: [&str; 9] = [
    "mp3", "wav", "ogg", "m4a", "flac", "mp4", "mov", "mkv", "webm",
];

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// A file must keep a stable size and mtime for this long before it is
    /// picked up; guards against reading half-written uploads.
    pub debounce_seconds: u64,
    pub poll_interval_seconds: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        WatcherSettings {
            debounce_seconds: 2,
            poll_interval_seconds: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FileSnapshot {
    size: u64,
    modified: Option<SystemTime>,
}

/// Monitors the input directory and turns stable file appearances into
/// jobs. Appearances are serialized: at most one pipeline runs at a time
/// per watcher instance.
pub struct Watcher {
    input_dir: PathBuf,
    manager: Arc<JobManager>,
    driver: Arc<PipelineDriver>,
    defaults: JobConfiguration,
    settings: WatcherSettings,
}

impl Watcher {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        manager: Arc<JobManager>,
        driver: Arc<PipelineDriver>,
        defaults: JobConfiguration,
        settings: WatcherSettings,
    ) -> Self {
        Watcher {
            input_dir: input_dir.into(),
            manager,
            driver,
            defaults,
            settings,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WatchError> {
        tokio::fs::create_dir_all(&self.input_dir)
            .await
            .map_err(|e| WatchError::Io {
                path: self.input_dir.display().to_string(),
                source: e,
            })?;

        tracing::info!(input = %self.input_dir.display(), "watching for media files");

        let debounce = Duration::from_secs(self.settings.debounce_seconds);
        let poll = Duration::from_secs(self.settings.poll_interval_seconds);
        let mut pending: HashMap<PathBuf, (FileSnapshot, Instant)> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                tracing::info!("watcher stopping");
                return Ok(());
            }

            let mut seen: Vec<(PathBuf, FileSnapshot)> = Vec::new();
            match std::fs::read_dir(&self.input_dir) {
                Ok(entries) => {
                    for entry in entries.filter_map(|e| e.ok()) {
                        let path = entry.path();
                        if !path.is_file() || !is_supported(&path) {
                            continue;
                        }
                        if let Ok(metadata) = entry.metadata() {
                            seen.push((
                                path,
                                FileSnapshot {
                                    size: metadata.len(),
                                    modified: metadata.modified().ok(),
                                },
                            ));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not scan input directory");
                }
            }

            pending.retain(|path, _| seen.iter().any(|(p, _)| p == path));

            let mut ready: Vec<PathBuf> = Vec::new();
            let now = Instant::now();
            for (path, snapshot) in seen {
                match pending.get(&path) {
                    Some((previous, since)) if *previous == snapshot => {
                        if now.duration_since(*since) >= debounce {
                            ready.push(path);
                        }
                    }
                    _ => {
                        pending.insert(path, (snapshot, now));
                    }
                }
            }

            for path in ready {
                pending.remove(&path);
                // Serialized on purpose: one pipeline at a time.
                self.process(&path, &cancel).await;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("watcher stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Create the job (which copies the file), verify the copy, delete the
    /// source, and run the full pipeline. Deletion is unconditional and
    /// immediate after a verified copy; a failed copy leaves the source in
    /// place.
    async fn process(&self, path: &Path, cancel: &CancellationToken) {
        tracing::info!(file = %path.display(), "new file detected");

        let mut job = match self.manager.create_job(path, self.defaults.clone()).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "could not create job");
                return;
            }
        };

        let source_size = std::fs::metadata(path).map(|m| m.len()).ok();
        let copy_size = job
            .working_copy()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len());
        if source_size.is_none() || source_size != copy_size {
            tracing::error!(
                file = %path.display(),
                job_id = %job.id,
                "working copy verification failed, keeping source in place"
            );
            return;
        }

        if let Err(e) = std::fs::remove_file(path) {
            tracing::error!(file = %path.display(), error = %e, "could not remove source after copy");
        } else {
            tracing::info!(file = %path.display(), "removed source from input directory");
        }

        match self
            .driver
            .execute(&mut job, StageName::Ingest, StageName::Shelve, cancel)
            .await
        {
            Ok(reached_shelve) => {
                if reached_shelve {
                    if let Err(e) = self.manager.finalize(&mut job).await {
                        tracing::error!(job_id = %job.id, error = %e, "finalization failed");
                    } else {
                        tracing::info!(job_id = %job.id, "job completed");
                    }
                }
            }
            Err(e) => {
                // The job stays in the working root with its failed state.
                tracing::error!(job_id = %job.id, error = %e, "pipeline failed");
            }
        }
    }
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let ext = e.to_string_lossy().to_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
