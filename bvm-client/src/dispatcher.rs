//! Event dispatcher and job progress state machine
//!
//! Owns the sole mutable copy of the progress matrix and the job progress
//! state. Events are applied strictly in arrival order on one task; consumers
//! read immutable [`JobSnapshot`]s and react to [`SideEffect`]s, never to raw
//! events. A faulty event must never poison the stream: payload validation
//! errors are absorbed into a generic status message and the next event is
//! processed normally.

use bvm_common::api::AnalysisResult;
use bvm_common::events::{
    AnalysisEvent, CompletePayload, EventEnvelope, PartialResultPayload, Stage, UnitStatus,
    GENERIC_ERROR_MESSAGE,
};
use bvm_common::progress::{global_percent, scoring_percent, CellStatus, ProgressMatrix};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Coarse job status derived from the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// Side effects the dispatcher requests but never performs itself
#[derive(Debug)]
pub enum SideEffect {
    /// Credits balance changed server-side; re-read it
    CreditsChanged,
    /// Terminal success; persist the final result exactly once
    JobComplete(Box<CompletePayload>),
    /// Terminal failure with the surfaced message
    JobFailed(String),
}

/// Immutable view of the job for consumers
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub stage: Stage,
    /// Monotonically non-decreasing global percent, 0-100
    pub percent: u8,
    pub message: String,
    pub competitors: Vec<String>,
    /// Prompts shown to the user (display list, distinct from matrix rows)
    pub prompts: Vec<String>,
    pub partial_results: Vec<PartialResultPayload>,
    pub resolved_units: usize,
    pub total_units: usize,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
}

/// Single-writer state machine over the analysis event stream
pub struct Dispatcher {
    matrix: ProgressMatrix,
    status: JobStatus,
    stage: Stage,
    percent: u8,
    message: String,
    competitors: Vec<String>,
    display_prompts: Vec<String>,
    partial_results: Vec<PartialResultPayload>,
    result: Option<AnalysisResult>,
    error: Option<String>,
    /// When the request carried explicit prompts the matrix rows are fixed
    /// up front; prompt-generated events then only update the display list.
    prompts_preseeded: bool,
    complete_emitted: bool,
    effects: UnboundedSender<SideEffect>,
}

impl Dispatcher {
    /// Create the state machine for a freshly-launched job
    ///
    /// `upfront_prompts` are the custom prompts sent with the request; when
    /// non-empty they seed the matrix rows immediately so early status events
    /// land in known cells.
    pub fn new(
        providers: &[String],
        upfront_prompts: &[String],
        effects: UnboundedSender<SideEffect>,
    ) -> Self {
        let mut matrix = ProgressMatrix::new(providers);
        let mut display_prompts = Vec::new();
        for prompt in upfront_prompts {
            if matrix.seed_prompt(prompt) {
                display_prompts.push(prompt.trim().to_string());
            }
        }
        let prompts_preseeded = !display_prompts.is_empty();
        Self {
            matrix,
            status: JobStatus::Running,
            stage: Stage::Initializing,
            percent: 0,
            message: String::new(),
            competitors: Vec::new(),
            display_prompts,
            partial_results: Vec::new(),
            result: None,
            error: None,
            prompts_preseeded,
            complete_emitted: false,
            effects,
        }
    }

    /// Apply one envelope in arrival order
    ///
    /// Never fails: malformed payloads degrade to a generic status message so
    /// one bad event cannot stall the stream.
    pub fn apply(&mut self, envelope: &EventEnvelope) {
        match AnalysisEvent::from_envelope(envelope) {
            Ok(event) => self.apply_event(event),
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "Rejected event payload");
                self.message = "Error processing analysis event".to_string();
            }
        }
    }

    fn apply_event(&mut self, event: AnalysisEvent) {
        match event {
            AnalysisEvent::Start => {
                debug!("Analysis stream opened");
            }
            AnalysisEvent::Progress(p) => {
                self.stage = p.stage;
                self.message = p.message;
                self.bump_percent(global_percent(p.stage, p.progress, &self.matrix));
            }
            AnalysisEvent::CompetitorFound(p) => {
                let name = p.competitor.trim().to_string();
                if !name.is_empty()
                    && !self
                        .competitors
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(&name))
                {
                    self.competitors.push(name);
                }
            }
            AnalysisEvent::PromptGenerated(p) => {
                if !self.prompts_preseeded {
                    self.matrix.seed_prompt(&p.prompt);
                }
                let prompt = p.prompt.trim().to_string();
                if !prompt.is_empty() && !self.display_prompts.contains(&prompt) {
                    self.display_prompts.push(prompt);
                }
            }
            AnalysisEvent::AnalysisStart(p) => {
                self.matrix
                    .set_status(&p.prompt, &p.provider, CellStatus::Running);
            }
            AnalysisEvent::PartialResult(p) => {
                self.matrix
                    .set_status(&p.prompt, &p.provider, CellStatus::Completed);
                self.partial_results.push(p);
            }
            AnalysisEvent::AnalysisComplete(p) => {
                let cell = match p.status {
                    UnitStatus::Completed => CellStatus::Completed,
                    UnitStatus::Failed => CellStatus::Failed,
                };
                self.matrix.set_status(&p.prompt, &p.provider, cell);
                // A straggler completion after the stage moved on must not
                // roll the displayed stage back
                if matches!(self.stage, Stage::Initializing | Stage::AnalyzingPrompts) {
                    self.stage = Stage::AnalyzingPrompts;
                }
                self.bump_percent(global_percent(Stage::AnalyzingPrompts, 0, &self.matrix));
            }
            AnalysisEvent::BrandExtractionProgress(p) => {
                self.stage = Stage::ExtractingBrands;
                self.message = p.message;
                self.bump_percent(global_percent(Stage::ExtractingBrands, p.progress, &self.matrix));
            }
            AnalysisEvent::Stage(p) => {
                self.stage = p.stage;
                self.message = p.message;
                self.bump_percent(global_percent(p.stage, p.progress, &self.matrix));
            }
            AnalysisEvent::ScoringStart(p) => {
                self.stage = Stage::CalculatingScores;
                self.message = format!("Scoring {}", p.competitor);
                self.bump_percent(scoring_percent(p.index, p.total));
            }
            AnalysisEvent::Complete(payload) => {
                self.stage = Stage::Finalizing;
                self.bump_percent(100);
                self.result = Some(payload.analysis.clone());
                self.status = JobStatus::Completed;
                if self.complete_emitted {
                    warn!("Duplicate complete event ignored");
                } else {
                    self.complete_emitted = true;
                    self.emit(SideEffect::JobComplete(payload));
                    self.emit(SideEffect::CreditsChanged);
                }
            }
            AnalysisEvent::Error(p) => {
                // A terminal error after a successful complete is a server
                // bug; the completed result wins.
                if self.status == JobStatus::Completed {
                    warn!(message = %p.message, "Error event after complete ignored");
                    return;
                }
                if self.error.is_none() {
                    let message = if p.message.trim().is_empty() {
                        GENERIC_ERROR_MESSAGE.to_string()
                    } else {
                        p.message
                    };
                    self.error = Some(message.clone());
                    self.message = message.clone();
                    self.status = JobStatus::Failed;
                    self.emit(SideEffect::JobFailed(message));
                }
            }
            AnalysisEvent::Credits => {
                self.emit(SideEffect::CreditsChanged);
            }
            AnalysisEvent::Unknown => {
                debug!("Ignoring unknown event kind");
            }
        }
    }

    /// Reset after a transport-level failure so a retry starts clean
    pub fn fail_connection(&mut self, message: impl Into<String>) {
        let message = message.into();
        let providers = self.matrix.providers().to_vec();
        self.matrix = ProgressMatrix::new(&providers);
        self.percent = 0;
        self.competitors.clear();
        self.display_prompts.clear();
        self.partial_results.clear();
        self.prompts_preseeded = false;
        self.stage = Stage::Initializing;
        self.status = JobStatus::Failed;
        self.error = Some(message.clone());
        self.message = message;
    }

    fn bump_percent(&mut self, candidate: u8) {
        self.percent = self.percent.max(candidate.min(100));
    }

    fn emit(&self, effect: SideEffect) {
        if self.effects.send(effect).is_err() {
            debug!("Side-effect receiver dropped; effect discarded");
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            status: self.status,
            stage: self.stage,
            percent: self.percent,
            message: self.message.clone(),
            competitors: self.competitors.clone(),
            prompts: self.display_prompts.clone(),
            partial_results: self.partial_results.clone(),
            resolved_units: self.matrix.resolved_cells(),
            total_units: self.matrix.total_cells(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bvm_common::api::AnalysisResult;
    use bvm_common::events::{
        AnalysisCompletePayload, AnalysisStartPayload, CompetitorFoundPayload, ErrorPayload,
        EventKind, ProgressPayload, PromptGeneratedPayload, ProviderResponse, ScoringStartPayload,
        Sentiment,
    };
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use uuid::Uuid;

    fn providers() -> Vec<String> {
        vec!["openai".to_string(), "anthropic".to_string()]
    }

    fn new_dispatcher(upfront: &[&str]) -> (Dispatcher, UnboundedReceiver<SideEffect>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let upfront: Vec<String> = upfront.iter().map(|s| s.to_string()).collect();
        (Dispatcher::new(&providers(), &upfront, tx), rx)
    }

    fn apply(d: &mut Dispatcher, event: AnalysisEvent) {
        d.apply(&event.into_envelope());
    }

    fn progress(stage: Stage, progress: u8, message: &str) -> AnalysisEvent {
        AnalysisEvent::Progress(ProgressPayload {
            stage,
            progress,
            message: message.to_string(),
        })
    }

    fn unit_done(prompt: &str, provider: &str, status: UnitStatus) -> AnalysisEvent {
        AnalysisEvent::AnalysisComplete(AnalysisCompletePayload {
            prompt: prompt.to_string(),
            provider: provider.to_string(),
            status,
        })
    }

    fn complete() -> AnalysisEvent {
        AnalysisEvent::Complete(Box::new(CompletePayload {
            analysis: AnalysisResult {
                run_id: Uuid::new_v4(),
                target: "acme.example".to_string(),
                brand: "Acme".to_string(),
                competitors: Vec::new(),
                overall_score: 61.5,
                prompts: vec!["best crm".to_string()],
                providers: providers(),
                completed_at: Utc::now(),
            },
            api_usage_summary: None,
        }))
    }

    fn drain(rx: &mut UnboundedReceiver<SideEffect>) -> Vec<SideEffect> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn full_pipeline_reaches_completed_with_monotonic_percent() {
        let (mut d, mut rx) = new_dispatcher(&[]);
        let mut last_percent = 0;
        let mut check = |d: &Dispatcher, last: &mut u8| {
            let p = d.snapshot().percent;
            assert!(p >= *last, "percent regressed: {} -> {}", last, p);
            *last = p;
        };

        apply(&mut d, AnalysisEvent::Start);
        apply(&mut d, progress(Stage::Initializing, 5, "Scraping site"));
        apply(
            &mut d,
            AnalysisEvent::CompetitorFound(CompetitorFoundPayload {
                competitor: "Rival".to_string(),
            }),
        );
        for prompt in ["best crm", "top crm tools"] {
            apply(
                &mut d,
                AnalysisEvent::PromptGenerated(PromptGeneratedPayload {
                    prompt: prompt.to_string(),
                }),
            );
        }
        check(&d, &mut last_percent);

        for prompt in ["best crm", "top crm tools"] {
            for provider in ["openai", "anthropic"] {
                apply(
                    &mut d,
                    AnalysisEvent::AnalysisStart(AnalysisStartPayload {
                        prompt: prompt.to_string(),
                        provider: provider.to_string(),
                    }),
                );
                apply(&mut d, unit_done(prompt, provider, UnitStatus::Completed));
                check(&d, &mut last_percent);
            }
        }
        assert_eq!(d.snapshot().percent, 70);

        apply(
            &mut d,
            AnalysisEvent::BrandExtractionProgress(ProgressPayload {
                stage: Stage::ExtractingBrands,
                progress: 75,
                message: "Extracting brands".to_string(),
            }),
        );
        check(&d, &mut last_percent);
        apply(
            &mut d,
            AnalysisEvent::Stage(ProgressPayload {
                stage: Stage::CalculatingScores,
                progress: 90,
                message: "Calculating scores".to_string(),
            }),
        );
        apply(
            &mut d,
            AnalysisEvent::ScoringStart(ScoringStartPayload {
                competitor: "Rival".to_string(),
                index: 1,
                total: 2,
            }),
        );
        check(&d, &mut last_percent);
        assert_eq!(d.snapshot().percent, 95);

        apply(&mut d, complete());
        let snap = d.snapshot();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.percent, 100);
        assert_eq!(snap.stage, Stage::Finalizing);
        assert!(snap.result.is_some());
        assert!(snap.error.is_none());

        let effects = drain(&mut rx);
        assert_eq!(effects.len(), 2);
        assert!(matches!(effects[0], SideEffect::JobComplete(_)));
        assert!(matches!(effects[1], SideEffect::CreditsChanged));
    }

    #[test]
    fn duplicate_complete_triggers_finalize_once() {
        let (mut d, mut rx) = new_dispatcher(&[]);
        apply(&mut d, complete());
        apply(&mut d, complete());

        let finalizes = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, SideEffect::JobComplete(_)))
            .count();
        assert_eq!(finalizes, 1);
        assert_eq!(d.snapshot().status, JobStatus::Completed);
    }

    #[test]
    fn error_event_fails_the_job_once() {
        let (mut d, mut rx) = new_dispatcher(&[]);
        apply(
            &mut d,
            AnalysisEvent::Error(ErrorPayload {
                message: "Provider quota exhausted".to_string(),
            }),
        );
        apply(
            &mut d,
            AnalysisEvent::Error(ErrorPayload {
                message: "different text".to_string(),
            }),
        );

        let snap = d.snapshot();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("Provider quota exhausted"));
        let effects = drain(&mut rx);
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0], SideEffect::JobFailed(m) if m == "Provider quota exhausted"));
    }

    #[test]
    fn blank_error_message_falls_back_to_generic() {
        let (mut d, _rx) = new_dispatcher(&[]);
        apply(
            &mut d,
            AnalysisEvent::Error(ErrorPayload {
                message: "   ".to_string(),
            }),
        );
        assert_eq!(d.snapshot().error.as_deref(), Some(GENERIC_ERROR_MESSAGE));
    }

    #[test]
    fn error_after_complete_does_not_override_result() {
        let (mut d, mut rx) = new_dispatcher(&[]);
        apply(&mut d, complete());
        apply(
            &mut d,
            AnalysisEvent::Error(ErrorPayload {
                message: "late failure".to_string(),
            }),
        );

        let snap = d.snapshot();
        assert_eq!(snap.status, JobStatus::Completed);
        assert!(snap.error.is_none());
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SideEffect::JobFailed(_))));
    }

    #[test]
    fn malformed_payload_degrades_without_stalling() {
        let (mut d, _rx) = new_dispatcher(&[]);
        // analysis-start without its provider field
        let bad = EventEnvelope::new(
            EventKind::AnalysisStart,
            None,
            json!({ "prompt": "best crm" }),
        );
        d.apply(&bad);
        assert_eq!(d.snapshot().message, "Error processing analysis event");
        assert_eq!(d.snapshot().status, JobStatus::Running);

        // The stream keeps working afterwards
        apply(&mut d, progress(Stage::AnalyzingPrompts, 0, "Analyzing"));
        assert_eq!(d.snapshot().stage, Stage::AnalyzingPrompts);
    }

    #[test]
    fn unknown_event_kind_is_ignored() {
        let (mut d, mut rx) = new_dispatcher(&[]);
        let before = d.snapshot();
        let env: EventEnvelope = serde_json::from_value(json!({
            "type": "telemetry-v2",
            "data": { "x": 1 },
            "timestamp": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        d.apply(&env);
        assert_eq!(d.snapshot(), before);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn preseeded_prompts_fix_the_matrix_rows() {
        let (mut d, _rx) = new_dispatcher(&["best crm", "top crm tools"]);
        assert_eq!(d.snapshot().total_units, 4);

        // Server echoes generated prompts; display list updates, rows do not
        apply(
            &mut d,
            AnalysisEvent::PromptGenerated(PromptGeneratedPayload {
                prompt: "a different prompt".to_string(),
            }),
        );
        let snap = d.snapshot();
        assert_eq!(snap.total_units, 4);
        assert!(snap.prompts.contains(&"a different prompt".to_string()));
    }

    #[test]
    fn failed_units_advance_percent_like_completed_ones() {
        let (mut d, _rx) = new_dispatcher(&["best crm"]);
        apply(&mut d, unit_done("best crm", "openai", UnitStatus::Failed));
        assert_eq!(d.snapshot().percent, 35);
        apply(&mut d, unit_done("best crm", "anthropic", UnitStatus::Completed));
        assert_eq!(d.snapshot().percent, 70);
    }

    #[test]
    fn percent_never_regresses_on_stale_stage_reports() {
        let (mut d, _rx) = new_dispatcher(&["best crm"]);
        apply(&mut d, unit_done("best crm", "openai", UnitStatus::Completed));
        apply(&mut d, unit_done("best crm", "anthropic", UnitStatus::Completed));
        assert_eq!(d.snapshot().percent, 70);

        // A late low progress report must not move the bar backwards
        apply(&mut d, progress(Stage::AnalyzingPrompts, 10, "still working"));
        assert_eq!(d.snapshot().percent, 70);
    }

    #[test]
    fn straggler_unit_completion_does_not_roll_the_stage_back() {
        let (mut d, _rx) = new_dispatcher(&["best crm", "top crm tools"]);
        apply(&mut d, unit_done("best crm", "openai", UnitStatus::Completed));
        apply(
            &mut d,
            AnalysisEvent::BrandExtractionProgress(ProgressPayload {
                stage: Stage::ExtractingBrands,
                progress: 72,
                message: "Extracting brands".to_string(),
            }),
        );
        assert_eq!(d.snapshot().stage, Stage::ExtractingBrands);

        // Late completion still resolves its cell, but the stage stays put
        apply(&mut d, unit_done("top crm tools", "openai", UnitStatus::Completed));
        let snap = d.snapshot();
        assert_eq!(snap.stage, Stage::ExtractingBrands);
        assert_eq!(snap.resolved_units, 2);
        assert_eq!(snap.percent, 72);
    }

    #[test]
    fn partial_results_mark_cells_completed_and_accumulate() {
        let (mut d, _rx) = new_dispatcher(&["best crm"]);
        apply(
            &mut d,
            AnalysisEvent::PartialResult(PartialResultPayload {
                prompt: "best crm".to_string(),
                provider: "openai".to_string(),
                response: ProviderResponse {
                    brand_mentioned: true,
                    brand_position: Some(1),
                    sentiment: Sentiment::Positive,
                    confidence: 0.9,
                },
            }),
        );
        let snap = d.snapshot();
        assert_eq!(snap.partial_results.len(), 1);
        assert_eq!(snap.resolved_units, 1);
    }

    #[test]
    fn competitors_deduplicate_case_insensitively() {
        let (mut d, _rx) = new_dispatcher(&[]);
        for name in ["Rival", "rival", " RIVAL  ", "Other"] {
            apply(
                &mut d,
                AnalysisEvent::CompetitorFound(CompetitorFoundPayload {
                    competitor: name.to_string(),
                }),
            );
        }
        assert_eq!(d.snapshot().competitors, vec!["Rival", "Other"]);
    }

    #[test]
    fn connection_failure_resets_progress_state() {
        let (mut d, _rx) = new_dispatcher(&["best crm"]);
        apply(&mut d, unit_done("best crm", "openai", UnitStatus::Completed));
        assert!(d.snapshot().percent > 0);

        d.fail_connection("Connection lost during analysis");
        let snap = d.snapshot();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.percent, 0);
        assert_eq!(snap.total_units, 0);
        assert!(snap.partial_results.is_empty());
        assert_eq!(snap.error.as_deref(), Some("Connection lost during analysis"));
    }
}
