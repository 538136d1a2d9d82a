use std::collections::BTreeSet;

use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use scrivano::application::ports::{SegmentEvent, TranscriptionError, TranscriptionProvider};
use scrivano::domain::{IngestResult, RetryPolicy, TranscriptSegment};
use scrivano::infrastructure::providers::{
    ApiKeyRequirement, BackendFamily, Capability, ProviderDescriptor, ProviderType, SpeechBackend,
};

fn descriptor(base_url: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        name: "verba".to_string(),
        display_name: "Verba".to_string(),
        provider_type: ProviderType::Local,
        family: BackendFamily::Speech,
        capabilities: BTreeSet::from([Capability::Transcription]),
        api_key_requirement: ApiKeyRequirement::None,
        base_url: base_url.to_string(),
        cost_endpoint: None,
        upstream_cache: false,
        supported_containers: vec!["ogg".to_string(), "wav".to_string()],
        accepts_uri: false,
        models: Vec::new(),
    }
}

async fn start_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{}", addr)
}

fn ingest_result(dir: &std::path::Path) -> IngestResult {
    let media = dir.join("original.wav");
    std::fs::write(&media, b"riff-ish bytes").unwrap();
    IngestResult {
        source_path: dir.join("note.wav"),
        working_copy_path: media,
        compressed_path: None,
        duration_seconds: 12.5,
        format: "wav".to_string(),
        bitrate: 256_000,
        file_size_bytes: 14,
        upstream_cache_handle: None,
        uploaded_uri: None,
    }
}

async fn collect(backend: &SpeechBackend, ingest: &IngestResult) -> Vec<TranscriptSegment> {
    let retry = RetryPolicy {
        retry_max: 1,
        retry_delay_seconds: 0,
        timeout_seconds: None,
    };
    let mut transcription = backend
        .transcribe(ingest, Some("en"), &retry, CancellationToken::new())
        .await
        .unwrap();

    let mut segments = Vec::new();
    while let Some(event) = transcription.segments.next().await {
        match event.unwrap() {
            SegmentEvent::Segment(segment) => segments.push(segment),
            SegmentEvent::EndMarker => break,
        }
    }
    segments
}

#[tokio::test]
async fn given_verbose_segments_when_transcribing_then_they_map_to_transcript_segments() {
    let base_url = start_server(Router::new().route(
        "/transcriptions",
        post(|| async {
            Json(json!({
                "language": "en",
                "segments": [
                    {"start": 0.0, "end": 3.5, "text": " Hello there. ", "speaker": "Ada"},
                    {"start": 3.5, "end": 5.0, "text": "Bye."},
                ],
            }))
        }),
    ))
    .await;

    let tmp = tempfile::tempdir().unwrap();
    let backend = SpeechBackend::new(descriptor(&base_url), "verba-base".to_string(), None);
    let segments = collect(&backend, &ingest_result(tmp.path())).await;

    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].speaker_id, "Ada");
    assert_eq!(segments[0].text, "Hello there.");
    assert_eq!(segments[1].speaker_id, "Speaker A");
    assert_eq!(segments[1].end_time, 5.0);
}

#[tokio::test]
async fn given_a_text_only_response_then_a_single_segment_spans_the_recording() {
    let base_url = start_server(Router::new().route(
        "/transcriptions",
        post(|| async { Json(json!({"text": "Just one line of speech."})) }),
    ))
    .await;

    let tmp = tempfile::tempdir().unwrap();
    let backend = SpeechBackend::new(descriptor(&base_url), "verba-base".to_string(), None);
    let segments = collect(&backend, &ingest_result(tmp.path())).await;

    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].text, "Just one line of speech.");
    assert_eq!(segments[0].start_time, 0.0);
    assert_eq!(segments[0].end_time, 12.5);
}

#[tokio::test]
async fn given_an_auth_rejection_then_the_call_fails_without_segments() {
    let base_url = start_server(Router::new().route(
        "/transcriptions",
        post(|| async { (axum::http::StatusCode::FORBIDDEN, "nope".to_string()) }),
    ))
    .await;

    let tmp = tempfile::tempdir().unwrap();
    let backend = SpeechBackend::new(descriptor(&base_url), "verba-base".to_string(), None);
    let retry = RetryPolicy {
        retry_max: 1,
        retry_delay_seconds: 0,
        timeout_seconds: None,
    };

    let err = backend
        .transcribe(
            &ingest_result(tmp.path()),
            None,
            &retry,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TranscriptionError::Auth(_)));
}
