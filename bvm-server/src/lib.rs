//! bvm-server - Brand Visibility Monitor analysis service
//!
//! Runs the multi-stage content-analysis job (scrape → competitors → prompts
//! → provider fan-out → brand extraction → scoring) and streams progress to
//! the waiting client as Server-Sent Events, with exactly-once finalize of
//! the run record and usage debit.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod runner;

pub use crate::error::{ApiError, ApiResult};

use crate::collaborators::{CreditsLedger, RunStore};
use crate::runner::JobRunner;
use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
    pub store: Arc<dyn RunStore>,
    pub ledger: Arc<dyn CreditsLedger>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        runner: Arc<JobRunner>,
        store: Arc<dyn RunStore>,
        ledger: Arc<dyn CreditsLedger>,
    ) -> Self {
        Self {
            runner,
            store,
            ledger,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health::health))
        .route("/brand-monitor/analyze", post(api::analyze::start_analysis))
        .route("/brand-monitor/runs/:run_id", get(api::runs::get_run))
        .route("/credits/balance", get(api::credits::get_balance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
