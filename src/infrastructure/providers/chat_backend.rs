use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{
    IngestSpecs, RefineInput, Refinement, RefinementError, RefinementProvider, SegmentEvent,
    Transcription, TranscriptionError, TranscriptionProvider, UpstreamMedia,
};
use crate::domain::{
    compact_pairs, EnrichedContext, IngestResult, RequiredFields, RetryPolicy, StageName,
    TranscriptSegment, UsageRecord,
};

use super::ProviderDescriptor;

const END_TOKEN: &str = "[END]";
const MAX_TURNS: u32 = 50;

/// Multimodal chat-completions backend: transcription as a JSONL
/// conversation terminated by an explicit end marker, refinement as a
/// single schema-directed completion. Supports an upstream media cache and
/// a post-hoc cost endpoint when the descriptor declares them.
pub struct ChatBackend {
    descriptor: ProviderDescriptor,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatBackend {
    pub fn new(descriptor: ProviderDescriptor, model: String, api_key: Option<String>) -> Self {
        ChatBackend {
            descriptor,
            model,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.descriptor.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post_chat(&self, body: &Value) -> Result<ChatResponse, TranscriptionError> {
        let response = self
            .authorized(self.client.post(self.endpoint("/chat/completions")))
            .json(body)
            .send()
            .await
            .map_err(|e| TranscriptionError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| TranscriptionError::MalformedResponse(e.to_string()))?;

        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TranscriptionError::MalformedResponse("response carries no message content".into())
            })?
            .to_string();

        Ok(ChatResponse {
            id: parsed.get("id").and_then(Value::as_str).map(String::from),
            content,
            input_tokens: parsed
                .pointer("/usage/prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: parsed
                .pointer("/usage/completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }

    /// Actual USD cost of one generation. When the descriptor names a cost
    /// endpoint the billing event is queried post-hoc; the pricing table is
    /// only a fallback.
    async fn generation_cost(
        &self,
        generation_id: Option<&str>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        if let (Some(endpoint), Some(id)) = (&self.descriptor.cost_endpoint, generation_id) {
            let url = format!("{}?id={}", self.endpoint(endpoint), id);
            let fetched = async {
                let response = self.authorized(self.client.get(&url)).send().await.ok()?;
                if !response.status().is_success() {
                    return None;
                }
                let body: Value = response.json().await.ok()?;
                body.pointer("/data/total_cost").and_then(Value::as_f64)
            }
            .await;

            match fetched {
                Some(cost) => return cost,
                None => {
                    tracing::warn!(generation_id = %id, "cost endpoint query failed, falling back to pricing table");
                }
            }
        }
        self.descriptor
            .table_cost(&self.model, input_tokens, output_tokens)
    }

    fn transcription_prompt(&self, language_hint: Option<&str>) -> String {
        let language_instruction = match language_hint {
            Some(lang) => format!("Transcribe in {}.\n", lang),
            None => String::new(),
        };
        format!(
            "Analyze the attached audio completely and transcribe the entire conversation.\n\
             {language_instruction}\
             Output format: JSON Lines.\n\
             1. The FIRST line must be a metadata object: {{\"speakers\": [...], \"language\": \"...\"}}\n\
             2. Every following line must be a compact JSON array: [start_time, end_time, \"Speaker\", \"Text\"]\n\
             Combine consecutive speech from the same speaker into one segment.\n\
             When finished, output {END_TOKEN} on a new line."
        )
    }

    fn audio_content(&self, ingest: &IngestResult) -> Value {
        // Prefer the uploaded URI; fall back to a local path reference for
        // descriptors that accept neither cache nor URI.
        match &ingest.uploaded_uri {
            Some(uri) => json!([
                {"type": "text", "text": ""},
                {"type": "file_uri", "file_uri": uri}
            ]),
            None => json!([
                {"type": "text", "text": ""},
                {"type": "file_path", "file_path": ingest.upload_source().display().to_string()}
            ]),
        }
    }
}

struct ChatResponse {
    id: Option<String>,
    content: String,
    input_tokens: u64,
    output_tokens: u64,
}

fn classify_status(status: u16, body: String) -> TranscriptionError {
    match status {
        401 | 403 => TranscriptionError::Auth(body),
        429 => TranscriptionError::RateLimited(body),
        500..=599 => TranscriptionError::Transient(format!("status {}: {}", status, body)),
        _ => TranscriptionError::Api { status, body },
    }
}

/// One parsed JSONL turn.
#[derive(Debug, Default)]
struct ParsedTurn {
    segments: Vec<TranscriptSegment>,
    language: Option<String>,
    truncated: bool,
    end_marker: bool,
}

fn parse_jsonl(text: &str) -> ParsedTurn {
    let mut turn = ParsedTurn::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("```") {
            continue;
        }

        match serde_json::from_str::<Value>(line) {
            Ok(Value::String(s)) if s == END_TOKEN => turn.end_marker = true,
            Ok(Value::Object(map)) => {
                if map.contains_key("speakers") || map.contains_key("language") {
                    if let Some(lang) = map.get("language").and_then(Value::as_str) {
                        turn.language = Some(lang.to_string());
                    }
                    continue;
                }
                // Dict-shaped segment despite instructions; accept it.
                if let Ok(segment) =
                    serde_json::from_value::<TranscriptSegment>(Value::Object(map))
                {
                    turn.segments.push(segment);
                }
            }
            Ok(Value::Array(items)) if items.len() >= 4 => {
                let start = items[0].as_f64().unwrap_or(0.0);
                let end = items[1].as_f64().unwrap_or(0.0);
                let speaker = items[2].as_str().unwrap_or("Speaker A").to_string();
                let text = items[3].as_str().unwrap_or_default().to_string();
                turn.segments.push(TranscriptSegment {
                    speaker_id: speaker,
                    start_time: start,
                    end_time: end,
                    text,
                    confidence: None,
                });
            }
            Ok(_) => {}
            Err(_) => {
                if line.contains(END_TOKEN) {
                    turn.end_marker = true;
                } else if line.starts_with('[') || line.starts_with('{') {
                    // Mid-object cutoff: the model hit its output limit and
                    // needs a continuation turn.
                    turn.truncated = true;
                }
            }
        }
    }

    turn
}

#[async_trait]
impl TranscriptionProvider for ChatBackend {
    fn ingest_specs(&self) -> IngestSpecs {
        IngestSpecs {
            needs_upstream_cache: self.descriptor.upstream_cache,
            supported_containers: self.descriptor.supported_containers.clone(),
            accepts_uri: self.descriptor.accepts_uri,
        }
    }

    async fn prepare_upstream(
        &self,
        media: &Path,
        _duration_seconds: f64,
    ) -> Result<Option<UpstreamMedia>, TranscriptionError> {
        if !self.descriptor.upstream_cache {
            return Ok(None);
        }

        let bytes = tokio::fs::read(media).await.map_err(|e| TranscriptionError::Io {
            path: media.display().to_string(),
            source: e,
        })?;
        let filename = media
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("upload-{}", Uuid::new_v4()));

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/octet-stream")
            .map_err(|e| TranscriptionError::Upload(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .authorized(self.client.post(self.endpoint("/files")))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::Upload(format!(
                "status {}: {}",
                status, body
            )));
        }

        let uploaded: Value = response
            .json()
            .await
            .map_err(|e| TranscriptionError::MalformedResponse(e.to_string()))?;
        let uri = uploaded
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| TranscriptionError::MalformedResponse("upload response has no uri".into()))?
            .to_string();

        // Cache creation can fail for short content; the plain upload still
        // works, so fall back with a warning.
        let cache_handle = match self
            .authorized(self.client.post(self.endpoint("/caches")))
            .json(&json!({"uri": uri, "model": self.model, "ttl_seconds": 3600}))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("name").and_then(Value::as_str).map(String::from)),
            Ok(response) => {
                tracing::warn!(status = %response.status(), "cache creation refused, continuing without cache");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache creation failed, continuing without cache");
                None
            }
        };

        Ok(Some(UpstreamMedia { cache_handle, uri }))
    }

    async fn release_upstream(&self, handle: &str) -> Result<(), TranscriptionError> {
        let url = self.endpoint(&format!("/caches/{}", handle));
        match self.authorized(self.client.delete(&url)).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(TranscriptionError::Api {
                status: response.status().as_u16(),
                body: "cache release refused".into(),
            }),
            Err(e) => Err(TranscriptionError::Transient(e.to_string())),
        }
    }

    async fn transcribe(
        &self,
        ingest: &IngestResult,
        language_hint: Option<&str>,
        retry: &RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Transcription, TranscriptionError> {
        let usage = Arc::new(Mutex::new(UsageRecord::new(
            StageName::Scribe,
            &self.descriptor.name,
            &self.model,
        )));
        let detected_language = Arc::new(Mutex::new(None));

        let (tx, mut rx) = mpsc::channel::<Result<SegmentEvent, TranscriptionError>>(64);

        let backend = ChatBackend {
            descriptor: self.descriptor.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            client: self.client.clone(),
        };
        let usage_task = Arc::clone(&usage);
        let language_task = Arc::clone(&detected_language);
        let retry = retry.clone();
        let mut messages = vec![json!({
            "role": "user",
            "content": backend.audio_content(ingest),
        })];
        if let Some(cache) = &ingest.upstream_cache_handle {
            messages[0]["cache"] = Value::String(cache.clone());
        }
        let prompt = backend.transcription_prompt(language_hint);

        tokio::spawn(async move {
            let started = Instant::now();
            let mut next_prompt = prompt;
            let mut turn_count: u32 = 0;

            'turns: while turn_count < MAX_TURNS {
                turn_count += 1;
                messages.push(json!({"role": "user", "content": next_prompt}));

                let body = json!({
                    "model": backend.model,
                    "messages": messages,
                    "temperature": 0.1,
                });

                let response = {
                    let mut attempt: u32 = 0;
                    loop {
                        let call = backend.post_chat(&body);
                        let result = tokio::select! {
                            _ = cancel.cancelled() => Err(TranscriptionError::Cancelled),
                            r = call => r,
                        };
                        match result {
                            Ok(response) => break Ok(response),
                            Err(e) if e.is_recoverable() && attempt < retry.retry_max => {
                                attempt += 1;
                                usage_task.lock().expect("usage lock").request_count += 1;
                                tracing::warn!(
                                    attempt,
                                    max = retry.retry_max,
                                    error = %e,
                                    "recoverable transcription error, retrying"
                                );
                                tokio::select! {
                                    _ = cancel.cancelled() => break Err(TranscriptionError::Cancelled),
                                    _ = tokio::time::sleep(retry.delay_for(attempt)) => {}
                                }
                            }
                            Err(e) => break Err(e),
                        }
                    }
                };

                let response = match response {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break 'turns;
                    }
                };

                {
                    let mut usage = usage_task.lock().expect("usage lock");
                    usage.add_tokens(response.input_tokens, response.output_tokens);
                    usage.request_count += 1;
                }
                let cost = backend
                    .generation_cost(
                        response.id.as_deref(),
                        response.input_tokens,
                        response.output_tokens,
                    )
                    .await;
                usage_task.lock().expect("usage lock").cost_usd += cost;

                let turn = parse_jsonl(&response.content);
                if let Some(lang) = &turn.language {
                    *language_task.lock().expect("language lock") = Some(lang.clone());
                }

                tracing::debug!(
                    turn = turn_count,
                    segments = turn.segments.len(),
                    truncated = turn.truncated,
                    end_marker = turn.end_marker,
                    "parsed transcription turn"
                );

                let got_segments = !turn.segments.is_empty();
                for segment in turn.segments {
                    if tx.send(Ok(SegmentEvent::Segment(segment))).await.is_err() {
                        break 'turns;
                    }
                }

                if turn.end_marker {
                    let _ = tx.send(Ok(SegmentEvent::EndMarker)).await;
                    break 'turns;
                }
                if turn.truncated {
                    messages.push(json!({"role": "assistant", "content": response.content}));
                    next_prompt = "Continue the transcription from where you stopped. \
                                   Start with a complete JSON object on a new line; do not \
                                   repeat the truncated line. Output strictly JSON Lines."
                        .to_string();
                    continue;
                }
                if !got_segments {
                    // No marker, no truncation, no segments: the stream has
                    // nothing more to say. Close rather than loop.
                    break 'turns;
                }
                messages.push(json!({"role": "assistant", "content": response.content}));
                next_prompt = "Continue the transcription. Output strictly JSON Lines and do \
                               not repeat the last segment."
                    .to_string();
            }

            usage_task.lock().expect("usage lock").duration_seconds =
                started.elapsed().as_secs_f64();
        });

        let segments = futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();

        Ok(Transcription {
            segments,
            usage,
            detected_language,
        })
    }
}

#[async_trait]
impl RefinementProvider for ChatBackend {
    async fn refine(
        &self,
        input: RefineInput<'_>,
        schema: &RequiredFields,
        language_hint: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Refinement, RefinementError> {
        let started = Instant::now();

        let shape: Value = schema
            .iter()
            .map(|(name, spec)| (name.clone(), spec.structure.to_shape_json()))
            .collect::<serde_json::Map<_, _>>()
            .into();
        let field_notes: String = schema
            .iter()
            .filter(|(_, spec)| !spec.description.is_empty())
            .map(|(name, spec)| format!("   - {}: {}\n", name, spec.description))
            .collect();

        let target_language = language_hint.unwrap_or("the language detected in the input");

        let (input_description, content) = match input {
            RefineInput::Transcript(segments) => {
                let compact = serde_json::to_string(&compact_pairs(segments))
                    .map_err(|e| RefinementError::MalformedResponse(e.to_string()))?;
                (
                    format!("INPUT TRANSCRIPT (list of [speaker, text] pairs):\n{}", compact),
                    Value::Null,
                )
            }
            RefineInput::Audio(ingest) => {
                let content = self.audio_content(ingest);
                (
                    "Listen to the attached audio directly and extract the requested data."
                        .to_string(),
                    content,
                )
            }
        };

        let prompt = format!(
            "You are a professional editor and analyst. Transform the input into \
             structured data.\n\n{input_description}\n\nINSTRUCTIONS:\n\
             1. Extract exactly the fields of the OUTPUT SCHEMA.\n\
             2. All output must be in {target_language}.\n{field_notes}\n\
             OUTPUT SCHEMA (JSON):\n{schema}",
            schema = serde_json::to_string_pretty(&shape)
                .map_err(|e| RefinementError::MalformedResponse(e.to_string()))?,
        );

        let message_content = if content.is_null() {
            Value::String(prompt)
        } else {
            let mut parts = content.as_array().cloned().unwrap_or_default();
            parts.push(json!({"type": "text", "text": prompt}));
            Value::Array(parts)
        };

        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": message_content}],
            "temperature": 0.3,
            "response_format": {"type": "json_object"},
        });
        if let RefineInput::Audio(ingest) = input {
            if let Some(cache) = &ingest.upstream_cache_handle {
                body["messages"][0]["cache"] = Value::String(cache.clone());
            }
        }

        let call = self.post_chat(&body);
        let response = tokio::select! {
            _ = cancel.cancelled() => Err(TranscriptionError::Cancelled),
            r = call => r,
        }
        .map_err(into_refinement_error)?;

        let mut parsed: Value = serde_json::from_str(&response.content)
            .map_err(|e| RefinementError::SchemaViolation(format!("not valid JSON: {}", e)))?;
        // Some models wrap the object in a one-element list.
        if let Value::Array(items) = parsed {
            parsed = items.into_iter().next().unwrap_or(Value::Null);
        }
        let context = EnrichedContext::from_object(parsed).ok_or_else(|| {
            RefinementError::SchemaViolation("provider returned a non-object payload".into())
        })?;

        let cost = self
            .generation_cost(
                response.id.as_deref(),
                response.input_tokens,
                response.output_tokens,
            )
            .await;

        let mut usage = UsageRecord::new(StageName::Refine, &self.descriptor.name, &self.model);
        usage.add_tokens(response.input_tokens, response.output_tokens);
        usage.cost_usd = cost;
        usage.request_count = 1;
        usage.duration_seconds = started.elapsed().as_secs_f64();

        Ok(Refinement { context, usage })
    }
}

fn into_refinement_error(e: TranscriptionError) -> RefinementError {
    match e {
        TranscriptionError::RateLimited(m) => RefinementError::RateLimited(m),
        TranscriptionError::Transient(m) => RefinementError::Transient(m),
        TranscriptionError::Auth(m) => RefinementError::Auth(m),
        TranscriptionError::Api { status, body } => RefinementError::Api { status, body },
        TranscriptionError::Cancelled => RefinementError::Cancelled,
        other => RefinementError::MalformedResponse(other.to_string()),
    }
}
