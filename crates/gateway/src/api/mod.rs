use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use lg_domain::Error;

use crate::state::AppState;

pub mod chat;
pub mod completion;
pub mod embeddings;
pub mod status;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat", post(chat::chat))
        .route("/v1/chat/stream", post(chat::chat_stream))
        .route("/v1/completion", post(completion::completion))
        .route("/v1/completion/stream", post(completion::completion_stream))
        .route("/v1/embeddings", post(embeddings::embeddings))
        .route("/v1/status", get(status::status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map domain errors onto HTTP statuses.
pub(crate) fn error_response(err: Error) -> axum::response::Response {
    let status = match &err {
        Error::UnknownModel(_)
        | Error::UnknownGrammar(_)
        | Error::Config(_)
        | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::ModelFileMissing(_)
        | Error::Download(_)
        | Error::ContextCreation(_)
        | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        // Client closed the request before dispatch.
        Error::Aborted => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
