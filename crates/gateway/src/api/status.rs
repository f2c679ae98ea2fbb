//! `GET /v1/status` — pool snapshot for operators.

use axum::extract::State;
use axum::response::Json;

use lg_pool::PoolStatus;

use crate::state::AppState;

pub async fn status(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.pool.status())
}
