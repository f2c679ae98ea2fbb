//! Text completion endpoints.
//!
//! - `POST /v1/completion`        — non-streaming
//! - `POST /v1/completion/stream` — SSE

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use lg_domain::sampling::SamplingParams;
use lg_pool::CompletionRequest;
use lg_runtime::StreamChunk;

use crate::api::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CompletionBody {
    pub model: String,
    pub prompt: String,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub stop_triggers: Vec<String>,
    #[serde(default)]
    pub cpu_threads: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
}

fn build_request(body: CompletionBody) -> (String, CompletionRequest) {
    (
        body.model,
        CompletionRequest {
            prompt: body.prompt,
            sampling: body.sampling,
            stop_triggers: body.stop_triggers,
            cpu_threads: body.cpu_threads,
            batch_size: body.batch_size,
        },
    )
}

pub async fn completion(
    State(state): State<AppState>,
    Json(body): Json<CompletionBody>,
) -> axum::response::Response {
    let (model, request) = build_request(body);
    let signal = CancellationToken::new();
    match state
        .pool
        .request_completion(&model, request, None, signal)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn completion_stream(
    State(state): State<AppState>,
    Json(body): Json<CompletionBody>,
) -> impl IntoResponse {
    let (model, request) = build_request(body);
    let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamChunk>(64);
    let signal = CancellationToken::new();
    let guard = signal.clone().drop_guard();

    let pool = state.pool.clone();
    let handle = tokio::spawn(async move {
        pool.request_completion(&model, request, Some(tx), signal)
            .await
    });

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(chunk) = rx.recv().await {
            let data = serde_json::json!({ "text": chunk.text, "tokens": chunk.tokens.len() });
            yield Ok::<_, std::convert::Infallible>(
                Event::default().event("chunk").data(data.to_string()),
            );
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
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
