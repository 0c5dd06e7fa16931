//! Run record lookup: GET /brand-monitor/runs/:run_id
//!
//! Serves the state persisted by the finalize-before-emit write, so a client
//! that disconnected right after the terminal event can re-fetch it.

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use bvm_common::api::RunRecord;
use uuid::Uuid;

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunRecord>> {
    let record = state
        .store
        .load_run(run_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", run_id)))?;
    Ok(Json(record))
}
