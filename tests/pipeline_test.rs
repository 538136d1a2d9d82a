use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use scrivano::application::pipeline::{
    GenerateStage, IngestStage, PipelineDriver, RefineStage, ScribeStage, ShelveStage,
    StageExecutor,
};
use scrivano::application::ports::{
    IngestSpecs, JobStore, MediaInfo, MediaTool, MediaToolError, RefineInput, Refinement,
    RefinementError, RefinementProvider, SegmentEvent, Transcription, TranscriptionError,
    TranscriptionProvider,
};
use scrivano::application::{JobManager, ManagerError};
use scrivano::domain::{
    ArtifactSpec, CompressionMode, FieldSpec, FieldStructure, IngestResult, Job,
    JobConfiguration, JobStatus, RequiredFields, RetryPolicy, ShelveConfig, StageBinding,
    StageName, StageStatus, TranscriptSegment, UsageRecord,
};
use scrivano::infrastructure::providers::{
    ApiKeyRequirement, BackendFamily, Capability, ProviderDescriptor, ProviderRegistry,
    ProviderType,
};
use scrivano::infrastructure::render::RendererRegistry;
use scrivano::infrastructure::store::FsJobStore;
use scrivano::infrastructure::templates::{TemplateDef, TemplateRegistry};

// ── Fakes ────────────────────────────────────────────────────────────────

struct FakeMedia;

#[async_trait]
impl MediaTool for FakeMedia {
    async fn probe(&self, _path: &Path) -> Result<MediaInfo, MediaToolError> {
        Ok(MediaInfo {
            duration_seconds: 60.0,
            format: "mp3".to_string(),
            bitrate: 128_000,
            file_size_bytes: 4096,
        })
    }

    async fn transcode_opus(
        &self,
        input: &Path,
        output: &Path,
        _trim_silence: bool,
    ) -> Result<(), MediaToolError> {
        std::fs::copy(input, output).map_err(|e| MediaToolError::Io {
            path: output.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ScribeBehavior {
    Segments { extra_end_markers: usize },
    BadOrdering,
}

struct FakeTranscriber {
    behavior: ScribeBehavior,
}

fn seg(speaker: &str, start: f64, end: f64, text: &str) -> TranscriptSegment {
    TranscriptSegment {
        speaker_id: speaker.to_string(),
        start_time: start,
        end_time: end,
        text: text.to_string(),
        confidence: None,
    }
}

#[async_trait]
impl TranscriptionProvider for FakeTranscriber {
    fn ingest_specs(&self) -> IngestSpecs {
        IngestSpecs {
            needs_upstream_cache: false,
            supported_containers: vec!["mp3".to_string(), "ogg".to_string()],
            accepts_uri: false,
        }
    }

    async fn transcribe(
        &self,
        _ingest: &IngestResult,
        _language_hint: Option<&str>,
        _retry: &RetryPolicy,
        _cancel: CancellationToken,
    ) -> Result<Transcription, TranscriptionError> {
        let mut events: Vec<Result<SegmentEvent, TranscriptionError>> = Vec::new();
        match self.behavior {
            ScribeBehavior::Segments { extra_end_markers } => {
                events.push(Ok(SegmentEvent::Segment(seg(
                    "Ada",
                    0.0,
                    4.0,
                    "Welcome everyone.",
                ))));
                events.push(Ok(SegmentEvent::Segment(seg("Ben", 4.0, 6.0, "Thanks."))));
                for _ in 0..=extra_end_markers {
                    events.push(Ok(SegmentEvent::EndMarker));
                }
            }
            ScribeBehavior::BadOrdering => {
                events.push(Ok(SegmentEvent::Segment(seg("Ada", 5.0, 2.0, "broken"))));
                events.push(Ok(SegmentEvent::EndMarker));
            }
        }

        let mut usage = UsageRecord::new(StageName::Scribe, "mock", "mock-1");
        usage.add_tokens(1_000, 4_000);
        usage.cost_usd = 0.01;
        usage.request_count = 1;
        usage.duration_seconds = 1.0;

        Ok(Transcription {
            segments: futures::stream::iter(events).boxed(),
            usage: Arc::new(Mutex::new(usage)),
            detected_language: Arc::new(Mutex::new(Some("en".to_string()))),
        })
    }
}

#[derive(Default)]
struct FakeRefiner {
    last_mode: Mutex<Option<String>>,
    last_schema_fields: Mutex<Vec<String>>,
}

#[async_trait]
impl RefinementProvider for FakeRefiner {
    async fn refine(
        &self,
        input: RefineInput<'_>,
        schema: &RequiredFields,
        _language_hint: Option<&str>,
        _cancel: CancellationToken,
    ) -> Result<Refinement, RefinementError> {
        let mode = match input {
            RefineInput::Transcript(_) => "standard",
            RefineInput::Audio(_) => "direct",
        };
        *self.last_mode.lock().unwrap() = Some(mode.to_string());
        *self.last_schema_fields.lock().unwrap() = schema.keys().cloned().collect();

        let mut object = serde_json::Map::new();
        object.insert("summary".to_string(), json!("Quarterly sync"));
        object.insert("participants".to_string(), json!(["Ada", "Ben"]));
        object.insert("language".to_string(), json!("en"));
        for field in schema.keys() {
            object
                .entry(field.clone())
                .or_insert_with(|| json!("filled"));
        }

        let mut usage = UsageRecord::new(StageName::Refine, "mock", "mock-1");
        usage.add_tokens(2_000, 500);
        usage.cost_usd = 0.005;
        usage.request_count = 1;
        usage.duration_seconds = 0.5;

        Ok(Refinement {
            context: scrivano::domain::EnrichedContext(object),
            usage,
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    work: PathBuf,
    results: PathBuf,
    input: PathBuf,
    store: Arc<FsJobStore>,
    manager: JobManager,
    driver: PipelineDriver,
    refiner: Arc<FakeRefiner>,
}

fn mock_descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "mock".to_string(),
        display_name: "Mock".to_string(),
        provider_type: ProviderType::Cloud,
        family: BackendFamily::Chat,
        capabilities: BTreeSet::from([Capability::Transcription, Capability::Refinement]),
        api_key_requirement: ApiKeyRequirement::None,
        base_url: "http://127.0.0.1:1/v1".to_string(),
        cost_endpoint: None,
        upstream_cache: false,
        supported_containers: vec!["mp3".to_string()],
        accepts_uri: false,
        models: Vec::new(),
    }
}

fn test_templates() -> TemplateRegistry {
    TemplateRegistry::from_templates(vec![
        TemplateDef {
            plugin: "markdown".to_string(),
            name: "summary".to_string(),
            description: String::new(),
            custom_fields: RequiredFields::new(),
            body: "# {{ summary }}\n".to_string(),
        },
        TemplateDef {
            plugin: "markdown".to_string(),
            name: "notes".to_string(),
            description: String::new(),
            custom_fields: [(
                "decisions".to_string(),
                FieldSpec {
                    description: "decisions made".to_string(),
                    structure: FieldStructure::array_of(FieldStructure::string()),
                },
            )]
            .into_iter()
            .collect(),
            body: "{{ summary }}\n".to_string(),
        },
        TemplateDef {
            plugin: "markdown".to_string(),
            name: "conflicting".to_string(),
            description: String::new(),
            custom_fields: [(
                "decisions".to_string(),
                FieldSpec {
                    description: "decisions as prose".to_string(),
                    structure: FieldStructure::string(),
                },
            )]
            .into_iter()
            .collect(),
            body: String::new(),
        },
        TemplateDef {
            plugin: "subtitles".to_string(),
            name: "captions".to_string(),
            description: String::new(),
            custom_fields: RequiredFields::new(),
            body: String::new(),
        },
    ])
}

fn harness(behavior: ScribeBehavior) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let work = tmp.path().join("work");
    let results = tmp.path().join("results");
    let input = tmp.path().join("input");
    std::fs::create_dir_all(&input).unwrap();

    let store = Arc::new(FsJobStore::new(&work).unwrap());
    let registry = Arc::new(ProviderRegistry::from_descriptors(vec![mock_descriptor()]));
    let refiner = Arc::new(FakeRefiner::default());
    registry.register_transcription("mock", "mock-1", Arc::new(FakeTranscriber { behavior }));
    registry.register_refinement(
        "mock",
        "mock-1",
        Arc::clone(&refiner) as Arc<dyn RefinementProvider>,
    );

    let templates = Arc::new(test_templates());
    let renderers = Arc::new(RendererRegistry::with_builtins());
    let media = Arc::new(FakeMedia);

    let executors: Vec<Arc<dyn StageExecutor>> = vec![
        Arc::new(IngestStage::new(media, Arc::clone(&registry))),
        Arc::new(ScribeStage::new(Arc::clone(&registry))),
        Arc::new(RefineStage::new(
            Arc::clone(&registry),
            Arc::clone(&templates),
        )),
        Arc::new(GenerateStage::new(Arc::clone(&templates), renderers)),
        Arc::new(ShelveStage::new(Arc::clone(&registry), &results)),
    ];

    let driver = PipelineDriver::new(store.clone() as Arc<dyn JobStore>, executors);
    let manager = JobManager::new(
        store.clone() as Arc<dyn JobStore>,
        templates,
        &results,
    );

    Harness {
        _tmp: tmp,
        work,
        results,
        input,
        store,
        manager,
        driver,
        refiner,
    }
}

fn configuration(artifacts: Vec<(&str, &str)>) -> JobConfiguration {
    JobConfiguration {
        language: "auto".to_string(),
        compression_mode: CompressionMode::Compressed,
        transcribe: StageBinding {
            provider: "mock".to_string(),
            model: "mock-1".to_string(),
        },
        refine: StageBinding {
            provider: "mock".to_string(),
            model: "mock-1".to_string(),
        },
        scribe: RetryPolicy {
            retry_max: 2,
            retry_delay_seconds: 0,
            timeout_seconds: None,
        },
        artifacts: artifacts
            .into_iter()
            .map(|(plugin, template)| ArtifactSpec {
                plugin: plugin.to_string(),
                template: template.to_string(),
                filename: None,
            })
            .collect(),
        shelve: ShelveConfig::default(),
        skip_transcript: false,
        debug: false,
    }
}

fn write_media(harness: &Harness, name: &str) -> PathBuf {
    let path = harness.input.join(name);
    std::fs::write(&path, b"fake audio bytes").unwrap();
    path
}

async fn run_full(harness: &Harness, job: &mut Job) -> Result<bool, scrivano::application::StageError> {
    harness
        .driver
        .execute(job, StageName::Ingest, StageName::Shelve, &CancellationToken::new())
        .await
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn given_a_media_file_when_running_the_full_pipeline_then_every_stage_completes() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![("markdown", "summary")]))
        .await
        .unwrap();
    let reached_shelve = run_full(&harness, &mut job).await.unwrap();
    assert!(reached_shelve);
    harness.manager.finalize(&mut job).await.unwrap();

    let loaded = harness.store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state.status, JobStatus::Completed);
    for stage in StageName::ALL {
        assert_eq!(
            loaded.state.stage(stage).status,
            StageStatus::Completed,
            "stage {} not completed",
            stage
        );
    }

    // Artifacts landed in the timeline layout of the results library.
    let date_path = loaded.state.created_at.format("%Y/%m/%d").to_string();
    let shelved = harness
        .results
        .join(date_path)
        .join(job.id.as_str())
        .join("summary.md");
    assert!(shelved.is_file(), "missing {}", shelved.display());
    let content = std::fs::read_to_string(&shelved).unwrap();
    assert!(content.contains("# Quarterly sync"));

    // Pruned working directory: nothing heavy left, bookkeeping retained.
    assert!(!loaded.dir.join("media").exists());
    assert!(!loaded.dir.join("transcripts").exists());
    assert!(!loaded.dir.join("artifacts").exists());
    assert!(loaded.dir.join("state.json").is_file());
    assert!(loaded.dir.join("meta.json").is_file());
    assert!(loaded.dir.join("_stages").is_dir());

    // One request per API-backed stage, totals equal the record sums.
    assert_eq!(loaded.meta.processing.request_count, 2);
    assert!((loaded.meta.processing.total_cost_usd - 0.015).abs() < 1e-9);
    assert!(loaded.meta.processing.total_cost_usd > 0.0);
    assert_eq!(loaded.meta.processing.total_tokens.input, 3_000);
    assert_eq!(loaded.meta.processing.total_tokens.output, 4_500);
    assert_eq!(loaded.meta.media.language.as_deref(), Some("en"));
}

#[tokio::test]
async fn given_stop_after_scribe_then_later_stages_stay_pending_and_the_job_remains() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![("markdown", "summary")]))
        .await
        .unwrap();
    let reached_shelve = harness
        .driver
        .execute(
            &mut job,
            StageName::Ingest,
            StageName::Scribe,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!reached_shelve);

    let loaded = harness.store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state.stage(StageName::Ingest).status, StageStatus::Completed);
    assert_eq!(loaded.state.stage(StageName::Scribe).status, StageStatus::Completed);
    for stage in [StageName::Refine, StageName::Generate, StageName::Shelve] {
        assert_eq!(loaded.state.stage(stage).status, StageStatus::Pending);
    }
    assert!(loaded.raw_transcript_path().is_file());
    assert!(loaded.dir.is_dir(), "job must stay in the working root");

    let transcript: Vec<TranscriptSegment> =
        serde_json::from_slice(&std::fs::read(loaded.raw_transcript_path()).unwrap()).unwrap();
    assert_eq!(transcript.len(), 2);
}

#[tokio::test]
async fn given_a_stopped_job_when_continuing_from_refine_then_the_pipeline_finishes() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![("markdown", "summary")]))
        .await
        .unwrap();
    harness
        .driver
        .execute(
            &mut job,
            StageName::Ingest,
            StageName::Scribe,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // The stage command without an id picks the latest job.
    let mut latest = harness.manager.resolve(None).await.unwrap();
    assert_eq!(latest.id, job.id);

    harness
        .manager
        .reset_from(&mut latest, StageName::Refine)
        .await
        .unwrap();
    let reached_shelve = harness
        .driver
        .execute(
            &mut latest,
            StageName::Refine,
            StageName::Shelve,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(reached_shelve);
    harness.manager.finalize(&mut latest).await.unwrap();

    let loaded = harness.store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state.status, JobStatus::Completed);
    assert_eq!(*harness.refiner.last_mode.lock().unwrap(), Some("standard".to_string()));
}

#[tokio::test]
async fn given_direct_mode_then_scribe_is_skipped_and_subtitles_are_dropped_with_a_reason() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "lecture.mp3");

    let mut config = configuration(vec![("markdown", "summary"), ("subtitles", "captions")]);
    config.skip_transcript = true;

    let mut job = harness.manager.create_job(&source, config).await.unwrap();
    let reached_shelve = run_full(&harness, &mut job).await.unwrap();
    assert!(reached_shelve);

    let loaded = harness.store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state.stage(StageName::Scribe).status, StageStatus::Skipped);
    assert_eq!(loaded.state.status, JobStatus::Completed);
    assert_eq!(*harness.refiner.last_mode.lock().unwrap(), Some("direct".to_string()));

    let record: Value =
        serde_json::from_slice(&std::fs::read(loaded.stage_record_path(StageName::Generate)).unwrap())
            .unwrap();
    let skipped = record["skipped"].as_array().unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0]["reason"], "NoTranscriptForSubtitles");
    assert_eq!(record["generated"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn given_an_empty_source_then_ingest_fails_before_any_provider_call() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = harness.input.join("empty.mp3");
    std::fs::write(&source, b"").unwrap();

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![("markdown", "summary")]))
        .await
        .unwrap();
    let err = run_full(&harness, &mut job).await.unwrap_err();
    assert!(err.to_string().contains("empty"), "got: {}", err);

    let loaded = harness.store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state.stage(StageName::Ingest).status, StageStatus::Failed);
    // Failure halts without cascading: later stages remain pending.
    for stage in StageName::Ingest.onwards().skip(1) {
        assert_eq!(loaded.state.stage(stage).status, StageStatus::Pending);
    }
}

#[tokio::test]
async fn given_a_segment_ending_before_it_starts_then_scribe_fails() {
    let harness = harness(ScribeBehavior::BadOrdering);
    let source = write_media(&harness, "meeting.mp3");

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![("markdown", "summary")]))
        .await
        .unwrap();
    let err = run_full(&harness, &mut job).await.unwrap_err();
    assert!(
        err.to_string().contains("segment ordering"),
        "got: {}",
        err
    );

    let loaded = harness.store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state.stage(StageName::Scribe).status, StageStatus::Failed);
}

#[tokio::test]
async fn given_repeated_end_markers_then_the_writer_terminates_after_the_first() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 5,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![("markdown", "summary")]))
        .await
        .unwrap();
    harness
        .driver
        .execute(
            &mut job,
            StageName::Ingest,
            StageName::Scribe,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let transcript: Vec<TranscriptSegment> =
        serde_json::from_slice(&std::fs::read(job.raw_transcript_path()).unwrap()).unwrap();
    assert_eq!(transcript.len(), 2);
}

#[tokio::test]
async fn given_a_retry_from_refine_then_every_later_stage_resets_to_pending() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut config = configuration(vec![("markdown", "summary")]);
    config.debug = true; // keep artifacts around after the run
    let mut job = harness.manager.create_job(&source, config).await.unwrap();
    run_full(&harness, &mut job).await.unwrap();

    harness
        .manager
        .reset_from(&mut job, StageName::Refine)
        .await
        .unwrap();

    let loaded = harness.store.load(&job.id).await.unwrap();
    for stage in [StageName::Ingest, StageName::Scribe] {
        assert_eq!(loaded.state.stage(stage).status, StageStatus::Completed);
    }
    for stage in [StageName::Refine, StageName::Generate, StageName::Shelve] {
        assert_eq!(loaded.state.stage(stage).status, StageStatus::Pending);
    }
    assert!(!loaded.enriched_context_path().exists());
    assert!(
        loaded.raw_transcript_path().is_file(),
        "upstream artifacts must survive a downstream reset"
    );
}

#[tokio::test]
async fn given_a_completed_job_when_shelving_again_then_the_destination_is_unchanged() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut config = configuration(vec![("markdown", "summary")]);
    config.debug = true;
    let mut job = harness.manager.create_job(&source, config).await.unwrap();
    run_full(&harness, &mut job).await.unwrap();

    let date_path = job.state.created_at.format("%Y/%m/%d").to_string();
    let shelved = harness
        .results
        .join(&date_path)
        .join(job.id.as_str())
        .join("summary.md");
    let first = std::fs::read(&shelved).unwrap();

    harness
        .manager
        .reset_from(&mut job, StageName::Shelve)
        .await
        .unwrap();
    harness
        .driver
        .execute(
            &mut job,
            StageName::Shelve,
            StageName::Shelve,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let second = std::fs::read(&shelved).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn given_conflicting_template_schemas_then_job_creation_fails_without_a_directory() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let err = harness
        .manager
        .create_job(
            &source,
            configuration(vec![("markdown", "notes"), ("markdown", "conflicting")]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Template(_)), "got: {}", err);
    assert!(err.to_string().contains("decisions"));

    let job_dirs = std::fs::read_dir(&harness.work)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .count();
    assert_eq!(job_dirs, 0, "no working directory may be created");
}

#[tokio::test]
async fn given_declared_custom_fields_then_the_refiner_receives_the_collected_schema() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![("markdown", "notes")]))
        .await
        .unwrap();
    run_full(&harness, &mut job).await.unwrap();

    let fields = harness.refiner.last_schema_fields.lock().unwrap().clone();
    assert_eq!(fields, vec!["decisions".to_string()]);
}

#[tokio::test]
async fn given_no_declared_fields_then_the_refiner_receives_the_default_schema() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![("markdown", "summary")]))
        .await
        .unwrap();
    run_full(&harness, &mut job).await.unwrap();

    let fields = harness.refiner.last_schema_fields.lock().unwrap().clone();
    for expected in [
        "action_items",
        "clean_text",
        "key_takeaways",
        "participants",
        "quotes",
        "summary",
    ] {
        assert!(fields.iter().any(|f| f == expected), "missing {}", expected);
    }
}

#[tokio::test]
async fn given_an_empty_artifact_list_then_shelve_fails_with_no_artifacts() {
    let harness = harness(ScribeBehavior::Segments {
        extra_end_markers: 0,
    });
    let source = write_media(&harness, "meeting.mp3");

    let mut job = harness
        .manager
        .create_job(&source, configuration(vec![]))
        .await
        .unwrap();
    let err = run_full(&harness, &mut job).await.unwrap_err();
    assert!(err.to_string().contains("no artifacts"), "got: {}", err);

    let loaded = harness.store.load(&job.id).await.unwrap();
    assert_eq!(loaded.state.stage(StageName::Generate).status, StageStatus::Completed);
    assert_eq!(loaded.state.stage(StageName::Shelve).status, StageStatus::Failed);
}
