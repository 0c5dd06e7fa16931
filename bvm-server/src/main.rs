//! bvm-server - Brand Visibility Monitor service binary

use anyhow::Result;
use bvm_server::collaborators::{
    AnswerProvider, CannedProvider, HttpScraper, InMemoryLedger, InMemoryRunStore, KeywordMatcher,
};
use bvm_server::config::ServerConfig;
use bvm_server::runner::{JobRunner, RunnerConfig};
use bvm_server::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting bvm-server (Brand Visibility Monitor)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load()?;
    info!("Providers enabled: {}", config.providers.join(", "));

    // Collaborator wiring. Real provider clients plug in behind the
    // AnswerProvider trait; the canned ones keep the demo self-contained.
    let scraper = Arc::new(HttpScraper::new()?);
    let providers: Vec<Arc<dyn AnswerProvider>> = config
        .providers
        .iter()
        .map(|name| {
            Arc::new(CannedProvider::new(name.clone(), Vec::new())) as Arc<dyn AnswerProvider>
        })
        .collect();
    let store = InMemoryRunStore::new();
    let ledger = InMemoryLedger::new(config.starting_balance);

    let runner = Arc::new(JobRunner::new(
        scraper,
        providers,
        Arc::new(KeywordMatcher),
        store.clone(),
        ledger.clone(),
        RunnerConfig {
            budget: Duration::from_secs(config.pipeline_budget_secs),
            credits_base: config.credits_base,
            credits_per_unit: config.credits_per_unit,
        },
    ));

    let state = AppState::new(runner, store, ledger);
    let app = bvm_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);
    info!("Health check: http://{}/health", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
