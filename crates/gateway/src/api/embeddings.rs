//! `POST /v1/embeddings` — embed a string or an array of inputs.
//! Non-string array entries are dropped silently.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use lg_pool::EmbeddingRequest;

use crate::api::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EmbeddingsBody {
    pub model: String,
    pub input: serde_json::Value,
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(body): Json<EmbeddingsBody>,
) -> axum::response::Response {
    let inputs = match body.input {
        serde_json::Value::Array(values) => values,
        other => vec![other],
    };
    let signal = CancellationToken::new();
    match state
        .pool
        .request_embedding(&body.model, EmbeddingRequest { inputs }, signal)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}
