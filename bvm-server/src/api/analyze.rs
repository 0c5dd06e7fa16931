//! Job launch endpoint: POST /brand-monitor/analyze → SSE event stream
//!
//! The response is a one-directional text event stream over a persistent
//! chunked body: one JSON envelope per `data:` record, blank-line delimited,
//! with heartbeat comments every 15 seconds. The runner task is detached and
//! continues to completion if the client disconnects.

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use bvm_common::api::AnalyzeRequest;
use bvm_common::events::EventKind;
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Actor attribution for the usage ledger; auth itself is out of scope
fn actor_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// POST /brand-monitor/analyze
pub async fn start_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AnalyzeRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if request.target.trim().is_empty() {
        return Err(ApiError::BadRequest("Target is required".to_string()));
    }

    let actor = actor_from_headers(&headers);
    let balance = state
        .ledger
        .balance(&actor)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if balance <= 0 {
        return Err(ApiError::InsufficientCredits(format!(
            "Balance is {} credits",
            balance
        )));
    }

    let run_id = Uuid::new_v4();
    info!(%run_id, actor = %actor, target = %request.target, "Accepted analysis job");

    let (tx, mut rx) = mpsc::channel(64);
    let runner = state.runner.clone();
    tokio::spawn(async move {
        runner.run(run_id, actor, request, tx).await;
    });

    let stream = async_stream::stream! {
        while let Some(envelope) = rx.recv().await {
            let terminal = matches!(envelope.kind, EventKind::Complete | EventKind::Error);
            match serde_json::to_string(&envelope) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => warn!(%run_id, error = ?e, "Failed to serialize event envelope"),
            }
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}
