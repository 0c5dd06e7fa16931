//! Event types for the analysis event stream
//!
//! One envelope per stream record: `{ type, stage?, data, timestamp }`. The
//! `data` field is untyped at the transport boundary and validated per kind by
//! [`AnalysisEvent::from_envelope`] at the dispatcher boundary. Ordering is
//! defined by arrival order within a connection; `timestamp` is informational.

use crate::api::{AnalysisResult, ApiUsageSummary};
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event kinds carried on the stream
///
/// Unknown kinds decode to [`EventKind::Unknown`] so a newer server never
/// breaks an older client; the dispatcher logs and ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Start,
    Progress,
    CompetitorFound,
    PromptGenerated,
    AnalysisStart,
    PartialResult,
    AnalysisComplete,
    BrandExtractionProgress,
    Stage,
    ScoringStart,
    Complete,
    Error,
    Credits,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Start => "start",
            EventKind::Progress => "progress",
            EventKind::CompetitorFound => "competitor-found",
            EventKind::PromptGenerated => "prompt-generated",
            EventKind::AnalysisStart => "analysis-start",
            EventKind::PartialResult => "partial-result",
            EventKind::AnalysisComplete => "analysis-complete",
            EventKind::BrandExtractionProgress => "brand-extraction-progress",
            EventKind::Stage => "stage",
            EventKind::ScoringStart => "scoring-start",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
            EventKind::Credits => "credits",
            EventKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Coarse pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Initializing,
    AnalyzingPrompts,
    ExtractingBrands,
    CalculatingScores,
    Finalizing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Initializing => "initializing",
            Stage::AnalyzingPrompts => "analyzing-prompts",
            Stage::ExtractingBrands => "extracting-brands",
            Stage::CalculatingScores => "calculating-scores",
            Stage::Finalizing => "finalizing",
        };
        write!(f, "{}", s)
    }
}

/// Wire-level event envelope
///
/// Envelopes are totally ordered by arrival within one connection; there is no
/// cross-connection ordering guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Present only on progress-bearing events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Kind-specific payload, validated by the dispatcher per kind
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(kind: EventKind, stage: Option<Stage>, data: Value) -> Self {
        Self {
            kind,
            stage,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Terminal verdict for one (prompt, provider) unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Completed,
    Failed,
}

/// Sentiment of a brand mention, as reported by the matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Brand-mention verdict for one provider answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub brand_mentioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_position: Option<u32>,
    pub sentiment: Sentiment,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub stage: Stage,
    /// Raw stage-reported progress, 0-100
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorFoundPayload {
    pub competitor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptGeneratedPayload {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStartPayload {
    pub prompt: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResultPayload {
    pub prompt: String,
    pub provider: String,
    pub response: ProviderResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCompletePayload {
    pub prompt: String,
    pub provider: String,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringStartPayload {
    pub competitor: String,
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub analysis: AnalysisResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_usage_summary: Option<ApiUsageSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Fallback text when an `error` payload does not carry a usable message
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred during analysis";

/// Typed view of one envelope, keyed by kind
///
/// The tagged-union counterpart of [`EventEnvelope`]: one concrete payload
/// struct per variant, produced by a type-directed parse of `envelope.data`.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    Start,
    Progress(ProgressPayload),
    CompetitorFound(CompetitorFoundPayload),
    PromptGenerated(PromptGeneratedPayload),
    AnalysisStart(AnalysisStartPayload),
    PartialResult(PartialResultPayload),
    AnalysisComplete(AnalysisCompletePayload),
    BrandExtractionProgress(ProgressPayload),
    Stage(ProgressPayload),
    ScoringStart(ScoringStartPayload),
    Complete(Box<CompletePayload>),
    Error(ErrorPayload),
    Credits,
    Unknown,
}

fn parse<T: serde::de::DeserializeOwned>(kind: EventKind, data: &Value) -> Result<T, Error> {
    serde_json::from_value(data.clone()).map_err(|e| Error::EventPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl AnalysisEvent {
    /// Type-directed parse of an envelope payload
    ///
    /// Payloads that fail to match their variant's required fields are
    /// rejected with [`Error::EventPayload`] rather than trusted. The `error`
    /// kind is the one exception: a malformed payload falls back to
    /// [`GENERIC_ERROR_MESSAGE`] so a broken server can still fail the job.
    pub fn from_envelope(env: &EventEnvelope) -> Result<Self, Error> {
        let kind = env.kind;
        let event = match kind {
            EventKind::Start => AnalysisEvent::Start,
            EventKind::Progress => AnalysisEvent::Progress(parse(kind, &env.data)?),
            EventKind::CompetitorFound => AnalysisEvent::CompetitorFound(parse(kind, &env.data)?),
            EventKind::PromptGenerated => AnalysisEvent::PromptGenerated(parse(kind, &env.data)?),
            EventKind::AnalysisStart => AnalysisEvent::AnalysisStart(parse(kind, &env.data)?),
            EventKind::PartialResult => AnalysisEvent::PartialResult(parse(kind, &env.data)?),
            EventKind::AnalysisComplete => {
                AnalysisEvent::AnalysisComplete(parse(kind, &env.data)?)
            }
            EventKind::BrandExtractionProgress => {
                AnalysisEvent::BrandExtractionProgress(parse(kind, &env.data)?)
            }
            EventKind::Stage => AnalysisEvent::Stage(parse(kind, &env.data)?),
            EventKind::ScoringStart => AnalysisEvent::ScoringStart(parse(kind, &env.data)?),
            EventKind::Complete => AnalysisEvent::Complete(Box::new(parse(kind, &env.data)?)),
            EventKind::Error => {
                let message = env
                    .data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(GENERIC_ERROR_MESSAGE)
                    .to_string();
                AnalysisEvent::Error(ErrorPayload { message })
            }
            EventKind::Credits => AnalysisEvent::Credits,
            EventKind::Unknown => AnalysisEvent::Unknown,
        };
        Ok(event)
    }

    /// Get event kind for this typed event
    pub fn kind(&self) -> EventKind {
        match self {
            AnalysisEvent::Start => EventKind::Start,
            AnalysisEvent::Progress(_) => EventKind::Progress,
            AnalysisEvent::CompetitorFound(_) => EventKind::CompetitorFound,
            AnalysisEvent::PromptGenerated(_) => EventKind::PromptGenerated,
            AnalysisEvent::AnalysisStart(_) => EventKind::AnalysisStart,
            AnalysisEvent::PartialResult(_) => EventKind::PartialResult,
            AnalysisEvent::AnalysisComplete(_) => EventKind::AnalysisComplete,
            AnalysisEvent::BrandExtractionProgress(_) => EventKind::BrandExtractionProgress,
            AnalysisEvent::Stage(_) => EventKind::Stage,
            AnalysisEvent::ScoringStart(_) => EventKind::ScoringStart,
            AnalysisEvent::Complete(_) => EventKind::Complete,
            AnalysisEvent::Error(_) => EventKind::Error,
            AnalysisEvent::Credits => EventKind::Credits,
            AnalysisEvent::Unknown => EventKind::Unknown,
        }
    }

    /// Terminal events end the job's stream semantically
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisEvent::Complete(_) | AnalysisEvent::Error(_))
    }

    /// Build the wire envelope for this event, stamped now
    ///
    /// The `stage` envelope field is set only for progress-bearing kinds.
    pub fn into_envelope(self) -> EventEnvelope {
        let kind = self.kind();
        let (stage, data) = match self {
            AnalysisEvent::Start | AnalysisEvent::Credits | AnalysisEvent::Unknown => {
                (None, Value::Null)
            }
            AnalysisEvent::Progress(p)
            | AnalysisEvent::BrandExtractionProgress(p)
            | AnalysisEvent::Stage(p) => (Some(p.stage), to_value(&p)),
            AnalysisEvent::CompetitorFound(p) => (None, to_value(&p)),
            AnalysisEvent::PromptGenerated(p) => (None, to_value(&p)),
            AnalysisEvent::AnalysisStart(p) => (Some(Stage::AnalyzingPrompts), to_value(&p)),
            AnalysisEvent::PartialResult(p) => (Some(Stage::AnalyzingPrompts), to_value(&p)),
            AnalysisEvent::AnalysisComplete(p) => (Some(Stage::AnalyzingPrompts), to_value(&p)),
            AnalysisEvent::ScoringStart(p) => (Some(Stage::CalculatingScores), to_value(&p)),
            AnalysisEvent::Complete(p) => (None, to_value(&*p)),
            AnalysisEvent::Error(p) => (None, to_value(&p)),
        };
        EventEnvelope::new(kind, stage, data)
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    // Payload structs only contain serializable fields; this cannot fail
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kinds_use_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&EventKind::AnalysisComplete).unwrap();
        assert_eq!(json, "\"analysis-complete\"");
        let json = serde_json::to_string(&EventKind::BrandExtractionProgress).unwrap();
        assert_eq!(json, "\"brand-extraction-progress\"");
        let json = serde_json::to_string(&Stage::AnalyzingPrompts).unwrap();
        assert_eq!(json, "\"analyzing-prompts\"");
    }

    #[test]
    fn unknown_kind_decodes_to_unknown() {
        let env: EventEnvelope = serde_json::from_value(json!({
            "type": "telemetry-v2",
            "data": { "anything": 1 },
            "timestamp": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(env.kind, EventKind::Unknown);
        assert_eq!(
            AnalysisEvent::from_envelope(&env).unwrap(),
            AnalysisEvent::Unknown
        );
    }

    #[test]
    fn analysis_complete_parses_required_fields() {
        let env: EventEnvelope = serde_json::from_value(json!({
            "type": "analysis-complete",
            "stage": "analyzing-prompts",
            "data": { "prompt": "best crm", "provider": "openai", "status": "failed" },
            "timestamp": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        match AnalysisEvent::from_envelope(&env).unwrap() {
            AnalysisEvent::AnalysisComplete(p) => {
                assert_eq!(p.prompt, "best crm");
                assert_eq!(p.provider, "openai");
                assert_eq!(p.status, UnitStatus::Failed);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let env = EventEnvelope::new(
            EventKind::AnalysisStart,
            None,
            json!({ "prompt": "best crm" }),
        );
        let err = AnalysisEvent::from_envelope(&env).unwrap_err();
        assert!(matches!(err, Error::EventPayload { .. }));
    }

    #[test]
    fn error_payload_falls_back_to_generic_message() {
        let env = EventEnvelope::new(EventKind::Error, None, json!({ "unexpected": true }));
        match AnalysisEvent::from_envelope(&env).unwrap() {
            AnalysisEvent::Error(p) => assert_eq!(p.message, GENERIC_ERROR_MESSAGE),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn partial_result_uses_camel_case_response_fields() {
        let payload = PartialResultPayload {
            prompt: "best crm".into(),
            provider: "openai".into(),
            response: ProviderResponse {
                brand_mentioned: true,
                brand_position: Some(2),
                sentiment: Sentiment::Positive,
                confidence: 0.9,
            },
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"brandMentioned\":true"));
        assert!(json.contains("\"brandPosition\":2"));

        let back: PartialResultPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn envelope_round_trip_preserves_stage() {
        let event = AnalysisEvent::Progress(ProgressPayload {
            stage: Stage::ExtractingBrands,
            progress: 40,
            message: "Extracting brand mentions".into(),
        });
        let env = event.clone().into_envelope();
        assert_eq!(env.stage, Some(Stage::ExtractingBrands));

        let wire = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(AnalysisEvent::from_envelope(&back).unwrap(), event);
    }

    #[test]
    fn terminal_events_are_flagged() {
        assert!(AnalysisEvent::Error(ErrorPayload {
            message: "boom".into()
        })
        .is_terminal());
        assert!(!AnalysisEvent::Credits.is_terminal());
        assert!(!AnalysisEvent::Start.is_terminal());
    }
}
