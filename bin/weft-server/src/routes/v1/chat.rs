//! OpenAI-compatible chat-completion route.
//!
//! Translates chat messages into one controller inference call. With
//! `stream: true` the response is server-sent events terminated by a
//! `[DONE]` sentinel; otherwise tokens accumulate until the terminal
//! chunk. Either way the edge feeds its measurements (TTFT, latency,
//! error rate, throughput) into the QoS monitor.

use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use weft_cluster::controller::{InferenceChunk, InferenceRequest};
use weft_qos::{QosMonitor, SloMetric};
use weft_types::RequestId;

use crate::error::ServerError;
use crate::schemas::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    Usage,
};
use crate::state::AppState;

/// Maximum allowed prompt length in bytes to prevent memory exhaustion.
const MAX_PROMPT_BYTES: usize = 128 * 1024; // 128 KiB

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ServerError> {
    if !req.messages.iter().any(|m| m.role == "user") {
        return Err(ServerError::BadRequest("no user message found".into()));
    }

    let prompt = build_prompt(&req.messages);
    if prompt.len() > MAX_PROMPT_BYTES {
        return Err(ServerError::BadRequest(format!(
            "prompt too large ({} bytes); maximum is {} bytes",
            prompt.len(),
            MAX_PROMPT_BYTES,
        )));
    }

    let max_tokens = req.max_tokens.unwrap_or(512);
    if max_tokens == 0 || max_tokens > 4096 {
        return Err(ServerError::BadRequest(format!(
            "invalid max_tokens ({max_tokens}): must be between 1 and 4096"
        )));
    }
    let temperature = req.temperature.unwrap_or(0.7);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ServerError::BadRequest(format!(
            "invalid temperature ({temperature}): must be between 0.0 and 2.0"
        )));
    }

    let request_id = RequestId::generate();
    debug!(%request_id, model = %req.model, prompt_len = prompt.len(), stream = req.stream, "chat completion request");

    let inference = InferenceRequest {
        request_id: request_id.clone(),
        model_id: req.model.clone(),
        prompt,
        max_tokens: Some(max_tokens),
        temperature: Some(temperature),
        top_p: req.top_p,
        stream: req.stream,
        priority: None,
    };

    let started = Instant::now();
    let chunk_rx = state
        .controller
        .handle_inference_request(inference)
        .await
        .map_err(|e| {
            record_failure(&state.qos, &req.model, started);
            ServerError::Cluster(e)
        })?;

    if req.stream {
        Ok(stream_response(state, req, request_id, chunk_rx, started))
    } else {
        buffered_response(state, req, request_id, chunk_rx, started).await
    }
}

/// Flatten the conversation into a single prompt string.
fn build_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&message.role);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant:");
    prompt
}

async fn buffered_response(
    state: AppState,
    req: ChatCompletionRequest,
    request_id: RequestId,
    mut chunk_rx: mpsc::Receiver<InferenceChunk>,
    started: Instant,
) -> Result<Response, ServerError> {
    let mut content = String::new();
    let mut first_token_at: Option<Instant> = None;

    while let Some(chunk) = chunk_rx.recv().await {
        match chunk {
            InferenceChunk::Token { text } => {
                if first_token_at.is_none() {
                    first_token_at = Some(Instant::now());
                }
                content.push_str(&text);
            }
            InferenceChunk::Done {
                tokens_generated, ..
            } => {
                record_request(&state.qos, &req.model, started, first_token_at, false);
                let response = ChatCompletionResponse {
                    id: format!("chatcmpl-{request_id}"),
                    object: "chat.completion",
                    created: Utc::now().timestamp(),
                    model: req.model,
                    choices: vec![ChatChoice {
                        index: 0,
                        message: ChatMessage {
                            role: "assistant".into(),
                            content,
                        },
                        finish_reason: "stop".into(),
                    }],
                    usage: Usage {
                        prompt_tokens: 0,
                        completion_tokens: tokens_generated,
                        total_tokens: tokens_generated,
                    },
                };
                return Ok(Json(response).into_response());
            }
            InferenceChunk::Error { code, message } => {
                record_request(&state.qos, &req.model, started, first_token_at, true);
                return Err(ServerError::Inference { code, message });
            }
        }
    }
    record_request(&state.qos, &req.model, started, first_token_at, true);
    Err(ServerError::Internal("stream ended unexpectedly".into()))
}

fn stream_response(
    state: AppState,
    req: ChatCompletionRequest,
    request_id: RequestId,
    mut chunk_rx: mpsc::Receiver<InferenceChunk>,
    started: Instant,
) -> Response {
    let (sse_tx, sse_rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let model = req.model.clone();
    let qos = state.qos.clone();

    tokio::spawn(async move {
        let id = format!("chatcmpl-{request_id}");
        let created = Utc::now().timestamp();
        let mut first_token_at: Option<Instant> = None;
        let mut failed = false;

        while let Some(chunk) = chunk_rx.recv().await {
            match chunk {
                InferenceChunk::Token { text } => {
                    if first_token_at.is_none() {
                        first_token_at = Some(Instant::now());
                    }
                    let body = ChatCompletionChunk::delta(&id, created, &model, text);
                    if send_json(&sse_tx, &body).await.is_err() {
                        return; // client disconnected; dropping rx cancels upstream
                    }
                }
                InferenceChunk::Done { .. } => {
                    let body = ChatCompletionChunk::finish(&id, created, &model, "stop");
                    let _ = send_json(&sse_tx, &body).await;
                    break;
                }
                InferenceChunk::Error { code, message } => {
                    failed = true;
                    let body = serde_json::json!({
                        "error": { "code": code, "message": message }
                    });
                    let _ = send_json(&sse_tx, &body).await;
                    break;
                }
            }
        }

        record_request(&qos, &model, started, first_token_at, failed);
        let _ = sse_tx.send(Ok(Event::default().data("[DONE]"))).await;
    });

    Sse::new(ReceiverStream::new(sse_rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn send_json<T: serde::Serialize>(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    body: &T,
) -> Result<(), ()> {
    match Event::default().json_data(body) {
        Ok(event) => tx.send(Ok(event)).await.map_err(|_| ()),
        Err(_) => Ok(()), // unserializable event: skip it, keep the stream
    }
}

fn record_request(
    qos: &QosMonitor,
    model: &str,
    started: Instant,
    first_token_at: Option<Instant>,
    failed: bool,
) {
    let qos = qos.clone();
    let model = model.to_owned();
    let latency_ms = started.elapsed().as_millis() as f64;
    let ttft_ms = first_token_at.map(|t| t.duration_since(started).as_millis() as f64);
    tokio::spawn(async move {
        if let Some(ttft) = ttft_ms {
            qos.record(SloMetric::Ttft, ttft, None, Some(model.clone()))
                .await;
        }
        qos.record(SloMetric::LatencyP95, latency_ms, None, Some(model.clone()))
            .await;
        qos.record(
            SloMetric::ErrorRate,
            if failed { 1.0 } else { 0.0 },
            None,
            Some(model.clone()),
        )
        .await;
        qos.record(SloMetric::Throughput, 1.0, None, Some(model)).await;
    });
}

fn record_failure(qos: &QosMonitor, model: &str, started: Instant) {
    record_request(qos, model, started, None, true);
}
