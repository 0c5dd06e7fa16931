//! Credits balance lookup: GET /credits/balance
//!
//! Clients re-read the balance here on `credits`/`complete` events; they
//! never compute it locally.

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use bvm_common::api::BalanceResponse;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub actor: Option<String>,
}

pub async fn get_balance(
    State(state): State<AppState>,
    Query(query): Query<BalanceQuery>,
) -> ApiResult<Json<BalanceResponse>> {
    let actor = query.actor.unwrap_or_else(|| "anonymous".to_string());
    let balance = state
        .ledger
        .balance(&actor)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(BalanceResponse { actor, balance }))
}
