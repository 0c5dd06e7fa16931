//! bvm-client - command-line consumer for the Brand Visibility Monitor

use anyhow::{Context, Result};
use async_trait::async_trait;
use bvm_client::session::{AnalysisSession, CreditsView, ResultSink, SessionOutcome};
use bvm_client::stream::StreamReader;
use bvm_common::api::{AnalyzeRequest, BalanceResponse};
use bvm_common::events::CompletePayload;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bvm-client", about = "Run a brand visibility analysis")]
struct Args {
    /// Base URL of the bvm-server instance
    #[arg(long, default_value = "http://127.0.0.1:5840", env = "BVM_SERVER_URL")]
    server: String,

    /// Target site to analyze, e.g. example.com
    target: String,

    /// Custom prompt (repeatable); omit to let the server generate prompts
    #[arg(long = "prompt")]
    prompts: Vec<String>,

    /// Known competitor to include (repeatable)
    #[arg(long = "competitor")]
    competitors: Vec<String>,

    /// Providers expected to answer, used to size the progress grid
    #[arg(long = "provider", default_values_t = default_providers())]
    providers: Vec<String>,

    /// Ask providers to ground answers with web search
    #[arg(long)]
    web_search: bool,

    /// Actor identity sent with the request
    #[arg(long, default_value = "anonymous", env = "BVM_ACTOR")]
    actor: String,

    /// Write the final result JSON here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

fn default_providers() -> Vec<String> {
    vec![
        "openai".to_string(),
        "anthropic".to_string(),
        "google".to_string(),
    ]
}

/// Writes the final result to a file or stdout
struct FileSink {
    path: Option<PathBuf>,
}

#[async_trait]
impl ResultSink for FileSink {
    async fn persist(&self, payload: &CompletePayload) -> Result<()> {
        let json = serde_json::to_string_pretty(payload)?;
        match &self.path {
            Some(path) => {
                tokio::fs::write(path, &json)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(path = %path.display(), "Result written");
            }
            None => println!("{}", json),
        }
        Ok(())
    }
}

/// Reads the balance back from the server after a debit
struct HttpCreditsView {
    client: reqwest::Client,
    base_url: String,
}

#[async_trait]
impl CreditsView for HttpCreditsView {
    async fn refresh(&self, actor: &str) -> Result<i64> {
        let balance: BalanceResponse = self
            .client
            .get(format!("{}/credits/balance", self.base_url))
            .query(&[("actor", actor)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(balance.balance)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let base_url = args.server.trim_end_matches('/').to_string();

    let request = AnalyzeRequest {
        target: args.target.clone(),
        prompts: args.prompts.clone(),
        competitors: args.competitors.clone(),
        use_web_search: args.web_search,
    };

    let reader = StreamReader::new(format!("{}/brand-monitor/analyze", base_url))?;
    let sink = Arc::new(FileSink {
        path: args.out.clone(),
    });
    let credits = Arc::new(HttpCreditsView {
        client: reqwest::Client::new(),
        base_url: base_url.clone(),
    });
    let mut session = AnalysisSession::new(
        reader,
        args.providers.clone(),
        sink,
        credits,
        args.actor.clone(),
    );

    // Ctrl-C aborts the watch; the server-side job keeps running
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    info!(target = %args.target, "Starting analysis");
    let mut last_line = String::new();
    let outcome = session
        .run(&request, &cancel, |snapshot| {
            let line = format!(
                "[{}] {:3}% {}",
                snapshot.stage, snapshot.percent, snapshot.message
            );
            if line != last_line {
                info!("{}", line);
                last_line = line;
            }
        })
        .await;

    match outcome {
        SessionOutcome::Completed { result, balance } => {
            info!(
                brand = %result.brand,
                score = result.overall_score,
                competitors = result.competitors.len(),
                "Analysis complete"
            );
            if let Some(balance) = balance {
                info!(balance, "Credits remaining");
            }
            Ok(())
        }
        SessionOutcome::Failed { message } => {
            warn!(message = %message, "Analysis failed");
            std::process::exit(1);
        }
        SessionOutcome::Aborted => {
            info!("Aborted; the job continues server-side");
            Ok(())
        }
    }
}
