//! Chat endpoints.
//!
//! - `POST /v1/chat`        — non-streaming: returns the full result
//! - `POST /v1/chat/stream` — SSE: streams chunks, then a final event

use std::collections::HashMap;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use lg_domain::chat::ChatMessage;
use lg_domain::function::{FunctionDef, FunctionMap};
use lg_domain::sampling::SamplingParams;
use lg_pool::{ChatRequest, ChatResult};
use lg_runtime::StreamChunk;

use crate::api::error_response;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A function declared on the wire. Wire functions never carry handlers;
/// calls to them are surfaced back to the caller.
#[derive(Debug, Deserialize)]
pub struct FunctionDecl {
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub parameters: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub functions: HashMap<String, FunctionDecl>,
    #[serde(default)]
    pub stop_triggers: Vec<String>,
    #[serde(default)]
    pub token_bias: HashMap<String, f32>,
    #[serde(default)]
    pub reset_context: bool,
}

fn build_request(body: ChatBody) -> (String, ChatRequest) {
    let mut functions = FunctionMap::new();
    for (name, decl) in body.functions {
        functions.insert(name, FunctionDef::new(decl.description, decl.parameters));
    }
    (
        body.model,
        ChatRequest {
            messages: body.messages,
            sampling: body.sampling,
            grammar: body.grammar,
            functions,
            stop_triggers: body.stop_triggers,
            token_bias: body.token_bias,
            reset_context: body.reset_context,
        },
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> axum::response::Response {
    let (model, request) = build_request(body);
    let signal = CancellationToken::new();
    match state.pool.request_chat(&model, request, None, signal).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    let (model, request) = build_request(body);
    let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(64);
    let signal = CancellationToken::new();
    let guard = signal.clone().drop_guard();

    let pool = state.pool.clone();
    let handle = tokio::spawn(async move {
        pool.request_chat(&model, request, Some(tx), signal).await
    });

    Sse::new(make_sse_stream(rx, handle, guard))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Chunks stream as `chunk` events; the request's outcome follows as one
/// `final` or `error` event. Dropping the stream (client disconnect)
/// cancels the request via the drop guard.
fn make_sse_stream(
    mut rx: tokio::sync::mpsc::Receiver<StreamChunk>,
    handle: tokio::task::JoinHandle<lg_domain::Result<ChatResult>>,
    guard: tokio_util::sync::DropGuard,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let _guard = guard;
        while let Some(chunk) = rx.recv().await {
            let data = serde_json::json!({
                "text": chunk.text,
                "tokens": chunk.tokens.len(),
            });
            yield Ok(Event::default().event("chunk").data(data.to_string()));
        }
        match handle.await {
            Ok(Ok(result)) => {
                let data = serde_json::to_string(&result).unwrap_or_default();
                yield Ok(Event::default().event("final").data(data));
            }
            Ok(Err(e)) => {
                let data = serde_json::json!({ "error": e.to_string() });
                yield Ok(Event::default().event("error").data(data.to_string()));
            }
            Err(e) => {
                let data = serde_json::json!({ "error": e.to_string() });
                yield Ok(Event::default().event("error").data(data.to_string()));
            }
        }
    }
}
