//! Prompt × provider fan-out for the analyzing-prompts stage
//!
//! Every (prompt, provider) unit is independent: it announces itself with
//! `analysis-start`, reports a `partial-result` on success, and always closes
//! with `analysis-complete`. A failed call never blocks or aborts the others.

use super::scoring::ordinal_position;
use super::EventSink;
use crate::collaborators::{AnswerProvider, BrandMatcher, ProviderAnswer};
use bvm_common::events::{
    AnalysisCompletePayload, AnalysisEvent, AnalysisStartPayload, PartialResultPayload,
    ProviderResponse, UnitStatus,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::warn;

/// Outcome of one (prompt, provider) unit
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub prompt: String,
    pub provider: String,
    /// None when the provider call failed
    pub answer: Option<ProviderAnswer>,
}

/// Run the full prompt × provider matrix
///
/// Concurrency is bounded by the size of the enabled-provider set; unit
/// events are emitted from inside each task, so their interleaving follows
/// actual completion order.
pub async fn run_prompt_matrix(
    providers: &[Arc<dyn AnswerProvider>],
    prompts: &[String],
    brand: &str,
    known_brands: &[String],
    matcher: &dyn BrandMatcher,
    use_web_search: bool,
    sink: &EventSink,
) -> Vec<UnitResult> {
    let concurrency = providers.len().max(1);
    let mut units = prompts
        .iter()
        .flat_map(|prompt| {
            providers
                .iter()
                .map(move |provider| (prompt.clone(), Arc::clone(provider)))
        })
        .collect::<Vec<_>>()
        .into_iter();

    // Seed up to `concurrency` units, then refill as each one finishes
    let mut in_flight = FuturesUnordered::new();
    for (prompt, provider) in units.by_ref().take(concurrency) {
        in_flight.push(run_unit(
            prompt,
            provider,
            brand,
            known_brands,
            matcher,
            use_web_search,
            sink,
        ));
    }

    let mut results = Vec::new();
    while let Some(result) = in_flight.next().await {
        results.push(result);
        if let Some((prompt, provider)) = units.next() {
            in_flight.push(run_unit(
                prompt,
                provider,
                brand,
                known_brands,
                matcher,
                use_web_search,
                sink,
            ));
        }
    }
    results
}

async fn run_unit(
    prompt: String,
    provider: Arc<dyn AnswerProvider>,
    brand: &str,
    known_brands: &[String],
    matcher: &dyn BrandMatcher,
    use_web_search: bool,
    sink: &EventSink,
) -> UnitResult {
    let provider_name = provider.name().to_string();
    sink.emit(AnalysisEvent::AnalysisStart(AnalysisStartPayload {
        prompt: prompt.clone(),
        provider: provider_name.clone(),
    }))
    .await;

    match provider.ask(&prompt, use_web_search).await {
        Ok(answer) => {
            let mention = matcher.find_mention(brand, &answer.text);
            let response = ProviderResponse {
                brand_mentioned: mention.mentioned,
                brand_position: ordinal_position(matcher, brand, known_brands, &answer.text),
                sentiment: mention.sentiment,
                confidence: mention.confidence,
            };
            sink.emit(AnalysisEvent::PartialResult(PartialResultPayload {
                prompt: prompt.clone(),
                provider: provider_name.clone(),
                response,
            }))
            .await;
            sink.emit(AnalysisEvent::AnalysisComplete(AnalysisCompletePayload {
                prompt: prompt.clone(),
                provider: provider_name.clone(),
                status: UnitStatus::Completed,
            }))
            .await;
            UnitResult {
                prompt,
                provider: provider_name,
                answer: Some(answer),
            }
        }
        Err(e) => {
            warn!(
                prompt = %prompt,
                provider = %provider_name,
                error = ?e,
                "Provider call failed"
            );
            sink.emit(AnalysisEvent::AnalysisComplete(AnalysisCompletePayload {
                prompt: prompt.clone(),
                provider: provider_name.clone(),
                status: UnitStatus::Failed,
            }))
            .await;
            UnitResult {
                prompt,
                provider: provider_name,
                answer: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::KeywordMatcher;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Provider that records how many asks run at once
    struct GaugedProvider {
        name: String,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GaugedProvider {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AnswerProvider for GaugedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn ask(&self, _prompt: &str, _use_web_search: bool) -> anyhow::Result<ProviderAnswer> {
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ProviderAnswer {
                text: "Acme is great".to_string(),
                tokens: 3,
            })
        }
    }

    #[tokio::test]
    async fn fan_out_runs_every_unit_within_the_concurrency_bound() {
        let provider = GaugedProvider::new("openai");
        let providers: Vec<Arc<dyn AnswerProvider>> = vec![Arc::clone(&provider) as _];
        let prompts: Vec<String> = (0..4).map(|i| format!("prompt {}", i)).collect();
        let known = vec!["Acme".to_string()];
        let (tx, _rx) = mpsc::channel(64);
        let sink = EventSink::new(tx);

        let results = run_prompt_matrix(
            &providers,
            &prompts,
            "Acme",
            &known,
            &KeywordMatcher,
            false,
            &sink,
        )
        .await;

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.answer.is_some()));
        // One enabled provider means at most one unit in flight
        assert_eq!(provider.peak.load(Ordering::SeqCst), 1);
    }
}
