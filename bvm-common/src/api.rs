//! Wire types for the BVM HTTP surface
//!
//! Shared between bvm-server handlers and the bvm-client stream reader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Job launch request (client → server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    /// Target site to analyze, e.g. "example.com"
    pub target: String,
    /// Custom prompt set; empty means the server generates prompts
    #[serde(default)]
    pub prompts: Vec<String>,
    /// Known competitors to include alongside discovered ones
    #[serde(default)]
    pub competitors: Vec<String>,
    #[serde(default)]
    pub use_web_search: bool,
}

/// JSON error body returned on a non-2xx response before streaming starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub message: String,
    pub code: String,
    pub status_code: u16,
}

/// Per-competitor visibility scores in the final result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorScore {
    pub name: String,
    /// Share of provider answers mentioning this brand, 0.0-1.0
    pub mention_rate: f64,
    /// Average ordinal position among mentioned brands, when mentioned at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_position: Option<f64>,
    /// Mean sentiment across mentions: -1.0 (negative) to 1.0 (positive)
    pub sentiment_score: f64,
    /// Combined visibility score, 0-100
    pub visibility_score: f64,
}

/// Full analysis result carried by the `complete` event and the run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub run_id: Uuid,
    pub target: String,
    /// Brand name identified for the target site
    pub brand: String,
    pub competitors: Vec<CompetitorScore>,
    /// Visibility score of the target brand itself, 0-100
    pub overall_score: f64,
    pub prompts: Vec<String>,
    pub providers: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Per-provider call accounting accumulated by the job runner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub calls: u32,
    pub failed_calls: u32,
    pub total_tokens: u64,
}

/// Cost accounting for one run, included in `complete.apiUsageSummary`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUsageSummary {
    pub calls: u32,
    pub failed_calls: u32,
    pub total_tokens: u64,
    /// Credits debited for this run
    pub credits_charged: i64,
    pub by_provider: BTreeMap<String, ProviderUsage>,
}

impl ApiUsageSummary {
    /// Record one provider call
    pub fn record(&mut self, provider: &str, tokens: u64, failed: bool) {
        self.calls += 1;
        self.total_tokens += tokens;
        let entry = self.by_provider.entry(provider.to_string()).or_default();
        entry.calls += 1;
        entry.total_tokens += tokens;
        if failed {
            self.failed_calls += 1;
            entry.failed_calls += 1;
        }
    }
}

/// Terminal status of a persisted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Durable record of one analysis run
///
/// Written by the server before the terminal event is emitted, so a client
/// that disconnects right after `complete`/`error` can re-fetch a consistent
/// state from `GET /brand-monitor/runs/:id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: Uuid,
    pub actor: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: ApiUsageSummary,
    pub created_at: DateTime<Utc>,
}

/// Response body for `GET /credits/balance`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub actor: String,
    pub balance: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_request_uses_camel_case() {
        let req = AnalyzeRequest {
            target: "example.com".into(),
            prompts: vec!["best crm".into()],
            competitors: vec![],
            use_web_search: true,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"useWebSearch\":true"));

        // Missing optional fields default
        let back: AnalyzeRequest =
            serde_json::from_str("{\"target\":\"example.com\"}").unwrap();
        assert!(back.prompts.is_empty());
        assert!(!back.use_web_search);
    }

    #[test]
    fn usage_summary_accumulates_per_provider() {
        let mut usage = ApiUsageSummary::default();
        usage.record("openai", 120, false);
        usage.record("openai", 80, true);
        usage.record("anthropic", 50, false);

        assert_eq!(usage.calls, 3);
        assert_eq!(usage.failed_calls, 1);
        assert_eq!(usage.total_tokens, 250);
        assert_eq!(usage.by_provider["openai"].calls, 2);
        assert_eq!(usage.by_provider["openai"].failed_calls, 1);
        assert_eq!(usage.by_provider["anthropic"].total_tokens, 50);
    }

    #[test]
    fn error_body_matches_contract_shape() {
        let body = ErrorBody {
            error: ErrorDetail {
                message: "Target is required".into(),
                code: "BAD_REQUEST".into(),
                status_code: 400,
            },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"statusCode\":400"));
        assert!(json.contains("\"code\":\"BAD_REQUEST\""));
    }
}
