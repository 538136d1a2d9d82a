use std::path::PathBuf;

use scrivano::application::ports::{JobFilter, JobStore, StoreError};
use scrivano::domain::{
    CompressionMode, JobConfiguration, JobStatus, RetryPolicy, ShelveConfig, StageBinding,
    StageName,
};
use scrivano::infrastructure::store::FsJobStore;

fn configuration() -> JobConfiguration {
    JobConfiguration {
        language: "auto".to_string(),
        compression_mode: CompressionMode::Compressed,
        transcribe: StageBinding {
            provider: "aurel".to_string(),
            model: "aurel-swift".to_string(),
        },
        refine: StageBinding {
            provider: "aurel".to_string(),
            model: "aurel-swift".to_string(),
        },
        scribe: RetryPolicy::default(),
        artifacts: Vec::new(),
        shelve: ShelveConfig::default(),
        skip_transcript: false,
        debug: false,
    }
}

fn write_source(dir: &std::path::Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"not really audio, but bytes").unwrap();
    path
}

#[tokio::test]
async fn given_a_source_file_when_creating_then_the_job_directory_is_scaffolded() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsJobStore::new(tmp.path().join("work")).unwrap();
    let source = write_source(tmp.path(), "meeting.mp3");

    let job = store.create(&source, configuration()).await.unwrap();

    assert!(job.dir.join("state.json").is_file());
    assert!(job.dir.join("meta.json").is_file());
    for sub in ["media", "transcripts", "artifacts", "_stages"] {
        assert!(job.dir.join(sub).is_dir(), "missing {}", sub);
    }
    assert!(job.dir.join("media/original.mp3").is_file());
    assert_eq!(job.state.status, JobStatus::Created);
    assert!(job.id.as_str().ends_with("_meeting"));
}

#[tokio::test]
async fn given_a_missing_source_when_creating_then_it_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsJobStore::new(tmp.path().join("work")).unwrap();

    let err = store
        .create(&tmp.path().join("absent.mp3"), configuration())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SourceMissing(_)));
}

#[tokio::test]
async fn given_a_saved_job_when_loading_then_state_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsJobStore::new(tmp.path().join("work")).unwrap();
    let source = write_source(tmp.path(), "meeting.mp3");

    let mut job = store.create(&source, configuration()).await.unwrap();
    job.state.mark_running(StageName::Ingest, chrono::Utc::now());
    job.state
        .mark_completed(StageName::Ingest, chrono::Utc::now());
    store.save(&job).await.unwrap();

    let loaded = store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state, job.state);
    assert_eq!(loaded.meta.job_id, job.meta.job_id);
}

#[tokio::test]
async fn given_a_corrupt_state_file_when_loading_then_stage_records_rebuild_it() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsJobStore::new(tmp.path().join("work")).unwrap();
    let source = write_source(tmp.path(), "meeting.mp3");

    let job = store.create(&source, configuration()).await.unwrap();
    std::fs::write(
        job.dir.join("_stages/ingest.json"),
        br#"{"stage": "ingest"}"#,
    )
    .unwrap();
    std::fs::write(job.dir.join("state.json"), b"{ torn write").unwrap();

    let loaded = store.load(&job.id).await.unwrap();
    assert_eq!(
        loaded.state.stage(StageName::Ingest).status,
        scrivano::domain::StageStatus::Completed
    );
    assert_eq!(
        loaded.state.stage(StageName::Scribe).status,
        scrivano::domain::StageStatus::Pending
    );
}

#[tokio::test]
async fn given_a_corrupt_state_and_no_stage_records_then_the_job_reports_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsJobStore::new(tmp.path().join("work")).unwrap();
    let source = write_source(tmp.path(), "meeting.mp3");

    let job = store.create(&source, configuration()).await.unwrap();
    std::fs::write(job.dir.join("state.json"), b"{ torn write").unwrap();

    let loaded = store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state.status, JobStatus::Failed);
}

#[tokio::test]
async fn given_several_jobs_when_asking_for_latest_then_most_recently_updated_wins() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsJobStore::new(tmp.path().join("work")).unwrap();
    let source = write_source(tmp.path(), "meeting.mp3");

    let first = store.create(&source, configuration()).await.unwrap();
    let mut second = store.create(&source, configuration()).await.unwrap();

    // Touch the second job later than the first.
    second
        .state
        .mark_running(StageName::Ingest, chrono::Utc::now() + chrono::Duration::seconds(5));
    store.save(&second).await.unwrap();

    let latest = store.latest(&JobFilter::default()).await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);
    assert_ne!(latest.id, first.id);
}

#[tokio::test]
async fn given_a_status_filter_when_listing_then_only_matching_jobs_return() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsJobStore::new(tmp.path().join("work")).unwrap();
    let source = write_source(tmp.path(), "meeting.mp3");

    let mut failed = store.create(&source, configuration()).await.unwrap();
    failed
        .state
        .mark_failed(StageName::Ingest, "boom".into(), chrono::Utc::now());
    store.save(&failed).await.unwrap();
    store.create(&source, configuration()).await.unwrap();

    let filter = JobFilter {
        status: Some(JobStatus::Failed),
        since: None,
    };
    let jobs = store.list(&filter).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, failed.id);
}

#[tokio::test]
async fn given_a_deleted_job_when_loading_then_it_is_gone() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsJobStore::new(tmp.path().join("work")).unwrap();
    let source = write_source(tmp.path(), "meeting.mp3");

    let job = store.create(&source, configuration()).await.unwrap();
    store.delete(&job.id).await.unwrap();

    assert!(matches!(
        store.load(&job.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(!job.dir.exists());
}
