//! One analysis session: stream, dispatch, finalize
//!
//! Ties the stream reader and dispatcher together and owns the finalize
//! latch, so the persist-result side effect runs at most once per job no
//! matter how the stream ends or how many terminal events a misbehaving
//! server sends.

use crate::dispatcher::{Dispatcher, JobSnapshot, SideEffect};
use crate::error::ClientError;
use crate::stream::{StreamEnd, StreamReader};
use bvm_common::api::{AnalysisResult, AnalyzeRequest};
use bvm_common::events::CompletePayload;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receives the final result exactly once per completed job
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(&self, payload: &CompletePayload) -> anyhow::Result<()>;
}

/// Re-reads the server-side credits balance after a debit
#[async_trait]
pub trait CreditsView: Send + Sync {
    async fn refresh(&self, actor: &str) -> anyhow::Result<i64>;
}

/// One-shot guard around the finalize side effect
///
/// Acquired before persisting begins, not after it succeeds, so a concurrent
/// duplicate can never slip through the gap. Released only when persisting
/// fails, to allow a retry.
#[derive(Debug, Default)]
pub struct FinalizeLatch {
    set: bool,
}

impl FinalizeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the latch; false means finalize already ran (or is running)
    pub fn try_acquire(&mut self) -> bool {
        if self.set {
            return false;
        }
        self.set = true;
        true
    }

    /// Roll back a failed finalize so it can be retried
    pub fn release(&mut self) {
        self.set = false;
    }

    pub fn is_set(&self) -> bool {
        self.set
    }

    /// Clear for a brand-new job; never called on retries of the same job
    pub fn reset(&mut self) {
        self.set = false;
    }
}

/// How one session ended, from the caller's point of view
#[derive(Debug)]
pub enum SessionOutcome {
    Completed {
        result: AnalysisResult,
        /// Balance after the post-run refresh, when the read succeeded
        balance: Option<i64>,
    },
    Failed {
        message: String,
    },
    Aborted,
}

/// Drives one analysis job end to end
pub struct AnalysisSession {
    reader: StreamReader,
    providers: Vec<String>,
    sink: Arc<dyn ResultSink>,
    credits: Arc<dyn CreditsView>,
    actor: String,
    latch: FinalizeLatch,
}

impl AnalysisSession {
    pub fn new(
        reader: StreamReader,
        providers: Vec<String>,
        sink: Arc<dyn ResultSink>,
        credits: Arc<dyn CreditsView>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            providers,
            sink,
            credits,
            actor: actor.into(),
            latch: FinalizeLatch::new(),
        }
    }

    pub fn has_finalized(&self) -> bool {
        self.latch.is_set()
    }

    /// Run one job and consume its stream to the end
    ///
    /// `observe` is called with a fresh snapshot after every applied event;
    /// pass a closure that renders progress, or `|_| {}`.
    pub async fn run(
        &mut self,
        request: &AnalyzeRequest,
        cancel: &CancellationToken,
        mut observe: impl FnMut(&JobSnapshot),
    ) -> SessionOutcome {
        // New job, new latch
        self.latch.reset();

        let (effects_tx, mut effects_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(&self.providers, &request.prompts, effects_tx);
        let mut connected = false;

        let end = self
            .reader
            .run(
                request,
                &self.actor,
                cancel,
                || connected = true,
                |envelope| {
                    dispatcher.apply(envelope);
                    observe(&dispatcher.snapshot());
                },
            )
            .await;

        match end {
            Ok(StreamEnd::Aborted) => {
                debug!("Session aborted; server-side job continues unobserved");
                SessionOutcome::Aborted
            }
            Ok(StreamEnd::Terminal) => {
                let balance = self.drain_effects(&mut effects_rx).await;
                self.outcome_from_snapshot(dispatcher.snapshot(), balance)
            }
            Err(error) => {
                // React to effects queued before the failure (e.g. a credits
                // debit notice) so they are not lost with the connection
                self.drain_effects(&mut effects_rx).await;
                let message = connection_failure_message(&error, connected);
                warn!(error = %error, "Analysis stream failed");
                dispatcher.fail_connection(message.clone());
                observe(&dispatcher.snapshot());
                SessionOutcome::Failed { message }
            }
        }
    }

    async fn drain_effects(
        &mut self,
        effects: &mut mpsc::UnboundedReceiver<SideEffect>,
    ) -> Option<i64> {
        let mut balance = None;
        while let Ok(effect) = effects.try_recv() {
            match effect {
                SideEffect::JobComplete(payload) => self.finalize(&payload).await,
                SideEffect::CreditsChanged => match self.credits.refresh(&self.actor).await {
                    Ok(b) => balance = Some(b),
                    Err(e) => warn!(error = %e, "Credits refresh failed"),
                },
                SideEffect::JobFailed(message) => {
                    debug!(message = %message, "Job reported failure");
                }
            }
        }
        balance
    }

    async fn finalize(&mut self, payload: &CompletePayload) {
        if !self.latch.try_acquire() {
            warn!("Duplicate finalize suppressed");
            return;
        }
        if let Err(e) = self.sink.persist(payload).await {
            // Roll the latch back so the result is not silently lost
            warn!(error = %e, "Failed to persist analysis result");
            self.latch.release();
        }
    }

    fn outcome_from_snapshot(&self, snapshot: JobSnapshot, balance: Option<i64>) -> SessionOutcome {
        if let Some(result) = snapshot.result {
            SessionOutcome::Completed { result, balance }
        } else {
            SessionOutcome::Failed {
                message: snapshot
                    .error
                    .unwrap_or_else(|| bvm_common::events::GENERIC_ERROR_MESSAGE.to_string()),
            }
        }
    }
}

fn connection_failure_message(error: &ClientError, connected: bool) -> String {
    match error {
        ClientError::Api { message, .. } => message.clone(),
        ClientError::StreamEndedEarly => {
            "Analysis stream ended before the job finished".to_string()
        }
        ClientError::Transport(_) if !connected => {
            "Could not connect to the analysis service".to_string()
        }
        ClientError::Transport(_) => "Connection lost during analysis".to_string(),
    }
}
