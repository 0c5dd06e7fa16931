//! Analysis job runner
//!
//! Drives the multi-stage pipeline for one run:
//!
//! INITIALIZING (scrape) → competitor identification → prompt generation →
//! ANALYZING-PROMPTS (prompt × provider fan-out) → EXTRACTING-BRANDS →
//! CALCULATING-SCORES → finalize
//!
//! Events are emitted on a per-job channel as work completes. The runner
//! keeps going when the client disconnects, enforces an overall wall-clock
//! budget, and always writes the terminal run record and usage ledger entry
//! BEFORE emitting the terminal `complete`/`error` envelope, so a client that
//! drops right after the terminal event can re-fetch a consistent state.

use crate::collaborators::{
    AnswerProvider, BrandMatcher, CreditsLedger, RunStore, ScrapedSite, Scraper,
};
use bvm_common::api::{AnalysisResult, AnalyzeRequest, ApiUsageSummary, RunRecord, RunStatus};
use bvm_common::events::{
    AnalysisEvent, CompetitorFoundPayload, CompletePayload, ErrorPayload, EventEnvelope,
    ProgressPayload, PromptGeneratedPayload, ScoringStartPayload, Stage,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod analysis;
mod scoring;

pub use analysis::UnitResult;

/// Outbound event channel for one job
///
/// A closed channel means the client went away; the job continues and the
/// event is dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EventEnvelope>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<EventEnvelope>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: AnalysisEvent) {
        let kind = event.kind();
        if self.tx.send(event.into_envelope()).await.is_err() {
            debug!(%kind, "No stream receiver, event dropped");
        }
    }

    async fn progress(&self, stage: Stage, progress: u8, message: impl Into<String>) {
        self.emit(AnalysisEvent::Progress(ProgressPayload {
            stage,
            progress,
            message: message.into(),
        }))
        .await;
    }
}

/// Runner tuning knobs, resolved from [`crate::config::ServerConfig`]
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Overall wall-clock budget for the whole pipeline
    pub budget: Duration,
    /// Flat credits debited per run
    pub credits_base: i64,
    /// Credits debited per provider call
    pub credits_per_unit: i64,
}

/// Job runner service
pub struct JobRunner {
    scraper: Arc<dyn Scraper>,
    providers: Vec<Arc<dyn AnswerProvider>>,
    matcher: Arc<dyn BrandMatcher>,
    store: Arc<dyn RunStore>,
    ledger: Arc<dyn CreditsLedger>,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(
        scraper: Arc<dyn Scraper>,
        providers: Vec<Arc<dyn AnswerProvider>>,
        matcher: Arc<dyn BrandMatcher>,
        store: Arc<dyn RunStore>,
        ledger: Arc<dyn CreditsLedger>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            scraper,
            providers,
            matcher,
            store,
            ledger,
            config,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Execute one run to its terminal state
    ///
    /// Exceeding the wall-clock budget forces a terminal `error` with the
    /// same finalize-before-emit discipline as any other failure.
    pub async fn run(
        &self,
        run_id: Uuid,
        actor: String,
        request: AnalyzeRequest,
        tx: mpsc::Sender<EventEnvelope>,
    ) {
        let sink = EventSink::new(tx);
        let started = std::time::Instant::now();
        info!(%run_id, actor = %actor, target = %request.target, "Starting analysis run");

        let outcome = tokio::time::timeout(
            self.config.budget,
            self.execute(run_id, &request, &sink),
        )
        .await;

        let (record, mut terminal) = match outcome {
            Ok(Ok((result, mut usage))) => {
                usage.credits_charged =
                    self.config.credits_base + self.config.credits_per_unit * usage.calls as i64;
                let record = RunRecord {
                    run_id,
                    actor: actor.clone(),
                    status: RunStatus::Completed,
                    result: Some(result.clone()),
                    error: None,
                    usage: usage.clone(),
                    created_at: Utc::now(),
                };
                let event = AnalysisEvent::Complete(Box::new(CompletePayload {
                    analysis: result,
                    api_usage_summary: Some(usage),
                }));
                (record, event)
            }
            Ok(Err(e)) => {
                warn!(%run_id, error = ?e, "Analysis run failed");
                let message = e.to_string();
                (
                    self.failed_record(run_id, &actor, &message),
                    AnalysisEvent::Error(ErrorPayload { message }),
                )
            }
            Err(_) => {
                let message = format!(
                    "Analysis timed out after {}s",
                    self.config.budget.as_secs()
                );
                warn!(%run_id, "{}", message);
                (
                    self.failed_record(run_id, &actor, &message),
                    AnalysisEvent::Error(ErrorPayload { message }),
                )
            }
        };

        // Finalize before emit: run record and ledger entry land first, so a
        // client re-fetching after the terminal event sees consistent state.
        if let Err(e) = self.store.save_run(&record).await {
            error!(%run_id, error = ?e, "Failed to persist run record");
            if matches!(terminal, AnalysisEvent::Complete(_)) {
                terminal = AnalysisEvent::Error(ErrorPayload {
                    message: "Failed to persist analysis result".to_string(),
                });
            }
        }
        if let Err(e) = self
            .ledger
            .debit(&actor, "brand-visibility-analysis", record.usage.credits_charged)
            .await
        {
            error!(%run_id, error = ?e, "Failed to record usage debit");
        }

        sink.emit(AnalysisEvent::Credits).await;
        sink.emit(terminal).await;

        info!(
            %run_id,
            status = ?record.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Analysis run finished"
        );
    }

    fn failed_record(&self, run_id: Uuid, actor: &str, message: &str) -> RunRecord {
        let usage = ApiUsageSummary {
            credits_charged: self.config.credits_base,
            ..Default::default()
        };
        RunRecord {
            run_id,
            actor: actor.to_string(),
            status: RunStatus::Failed,
            result: None,
            error: Some(message.to_string()),
            usage,
            created_at: Utc::now(),
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: &AnalyzeRequest,
        sink: &EventSink,
    ) -> anyhow::Result<(AnalysisResult, ApiUsageSummary)> {
        sink.emit(AnalysisEvent::Start).await;

        // Stage 1: INITIALIZING - scrape the target site
        sink.progress(
            Stage::Initializing,
            0,
            format!("Fetching content from {}", request.target),
        )
        .await;
        let site = self.scraper.scrape(&request.target).await?;
        sink.progress(
            Stage::Initializing,
            40,
            format!("Identified brand: {}", site.brand),
        )
        .await;

        // Stage 2: competitor identification
        let competitors = identify_competitors(request, &site);
        for competitor in &competitors {
            sink.emit(AnalysisEvent::CompetitorFound(CompetitorFoundPayload {
                competitor: competitor.clone(),
            }))
            .await;
        }
        sink.progress(
            Stage::Initializing,
            70,
            format!("Found {} competitors", competitors.len()),
        )
        .await;

        // Stage 3: prompt generation
        let prompts = build_prompts(request, &site);
        if prompts.is_empty() {
            anyhow::bail!("No prompts could be generated for {}", request.target);
        }
        for prompt in &prompts {
            sink.emit(AnalysisEvent::PromptGenerated(PromptGeneratedPayload {
                prompt: prompt.clone(),
            }))
            .await;
        }

        // Stage 4: ANALYZING-PROMPTS - prompt × provider fan-out
        sink.progress(
            Stage::AnalyzingPrompts,
            0,
            format!(
                "Analyzing {} prompts across {} providers",
                prompts.len(),
                self.providers.len()
            ),
        )
        .await;
        let mut known_brands = vec![site.brand.clone()];
        known_brands.extend(competitors.iter().cloned());
        let units = analysis::run_prompt_matrix(
            &self.providers,
            &prompts,
            &site.brand,
            &known_brands,
            self.matcher.as_ref(),
            request.use_web_search,
            sink,
        )
        .await;

        let mut usage = ApiUsageSummary::default();
        for unit in &units {
            let (tokens, failed) = match &unit.answer {
                Some(answer) => (answer.tokens, false),
                None => (0, true),
            };
            usage.record(&unit.provider, tokens, failed);
        }

        // Stage 5: EXTRACTING-BRANDS
        let answers: Vec<&str> = units
            .iter()
            .filter_map(|u| u.answer.as_ref().map(|a| a.text.as_str()))
            .collect();
        let mut stats = Vec::with_capacity(known_brands.len());
        for (i, name) in known_brands.iter().enumerate() {
            let percent =
                (100.0 * (i + 1) as f64 / known_brands.len() as f64).round() as u8;
            sink.emit(AnalysisEvent::BrandExtractionProgress(ProgressPayload {
                stage: Stage::ExtractingBrands,
                progress: percent,
                message: format!("Extracting mentions of {}", name),
            }))
            .await;
            stats.push(scoring::extract_brand_stats(
                self.matcher.as_ref(),
                name,
                &known_brands,
                &answers,
            ));
        }

        // Stage 6: CALCULATING-SCORES
        sink.emit(AnalysisEvent::Stage(ProgressPayload {
            stage: Stage::CalculatingScores,
            progress: 0,
            message: "Calculating visibility scores".to_string(),
        }))
        .await;
        let total = competitors.len();
        let mut competitor_scores = Vec::with_capacity(total);
        for (index, competitor) in competitors.iter().enumerate() {
            sink.emit(AnalysisEvent::ScoringStart(ScoringStartPayload {
                competitor: competitor.clone(),
                index,
                total,
            }))
            .await;
            let stat = stats
                .iter()
                .find(|s| &s.brand == competitor)
                .cloned()
                .unwrap_or_else(|| scoring::BrandStats::empty(competitor));
            competitor_scores.push(scoring::score_brand(&stat));
        }
        let target_stat = stats
            .iter()
            .find(|s| s.brand == site.brand)
            .cloned()
            .unwrap_or_else(|| scoring::BrandStats::empty(&site.brand));
        let overall_score = scoring::score_brand(&target_stat).visibility_score;
        sink.emit(AnalysisEvent::Stage(ProgressPayload {
            stage: Stage::CalculatingScores,
            progress: 100,
            message: "Visibility scores calculated".to_string(),
        }))
        .await;

        let result = AnalysisResult {
            run_id,
            target: request.target.clone(),
            brand: site.brand,
            competitors: competitor_scores,
            overall_score,
            prompts,
            providers: self.provider_names(),
            completed_at: Utc::now(),
        };
        Ok((result, usage))
    }
}

/// Merge caller-supplied competitors with ones derived from the scrape
fn identify_competitors(request: &AnalyzeRequest, site: &ScrapedSite) -> Vec<String> {
    let mut competitors: Vec<String> = Vec::new();
    for name in request
        .competitors
        .iter()
        .chain(site.keywords.iter().take(5))
    {
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case(&site.brand) {
            continue;
        }
        if !competitors.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            competitors.push(name.to_string());
        }
    }
    competitors
}

/// Use the caller's prompt set when given, otherwise generate from the scrape
fn build_prompts(request: &AnalyzeRequest, site: &ScrapedSite) -> Vec<String> {
    let mut prompts: Vec<String> = Vec::new();
    if !request.prompts.is_empty() {
        for prompt in &request.prompts {
            let prompt = prompt.trim();
            if !prompt.is_empty() && !prompts.iter().any(|p| p == prompt) {
                prompts.push(prompt.to_string());
            }
        }
        return prompts;
    }
    for keyword in site.keywords.iter().take(3) {
        prompts.push(format!("What are the best {} options?", keyword));
    }
    if prompts.is_empty() {
        prompts.push(format!("What are the best alternatives to {}?", site.brand));
    }
    prompts
}
