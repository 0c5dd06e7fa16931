//! SSE stream reader for the analyze endpoint
//!
//! Opens the POST request, checks the status line before treating the body as
//! a stream, then feeds raw bytes through the frame decoder and hands decoded
//! envelopes to the caller in arrival order. Stream health is judged by
//! whether a terminal event was seen, never by transport EOF alone.

use crate::error::ClientError;
use bvm_common::api::{AnalyzeRequest, ErrorBody};
use bvm_common::events::{EventEnvelope, EventKind};
use bvm_common::sse::SseFrameDecoder;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a healthy read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// A terminal `complete` or `error` event arrived
    Terminal,
    /// The caller cancelled; the server-side job keeps running
    Aborted,
}

/// Connects to the analyze endpoint and drives one event stream
pub struct StreamReader {
    client: reqwest::Client,
    endpoint: String,
}

impl StreamReader {
    /// `endpoint` is the full analyze URL, e.g. `http://host:5840/brand-monitor/analyze`
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bvm-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Run the stream to its end
    ///
    /// `on_connected` fires exactly once, after the 2xx status line and before
    /// the first event is delivered. `on_event` receives every well-formed
    /// envelope in arrival order; malformed records are logged and skipped.
    ///
    /// A clean EOF without a terminal event is a failure
    /// ([`ClientError::StreamEndedEarly`]), not a success.
    pub async fn run(
        &self,
        request: &AnalyzeRequest,
        actor: &str,
        cancel: &CancellationToken,
        on_connected: impl FnOnce(),
        mut on_event: impl FnMut(&EventEnvelope),
    ) -> Result<StreamEnd, ClientError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-actor", actor)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status.as_u16(), response.json().await.ok()));
        }
        on_connected();
        debug!(endpoint = %self.endpoint, "Analysis stream connected");

        let mut decoder = SseFrameDecoder::new();
        let mut saw_terminal = false;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stream read cancelled by caller");
                    return Ok(StreamEnd::Aborted);
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for payload in decoder.push(&bytes) {
                        match serde_json::from_str::<EventEnvelope>(&payload) {
                            Ok(envelope) => {
                                if matches!(envelope.kind, EventKind::Complete | EventKind::Error) {
                                    saw_terminal = true;
                                }
                                on_event(&envelope);
                            }
                            Err(e) => {
                                warn!(error = %e, "Skipping malformed stream record");
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    // A drop after the terminal event changes nothing: the
                    // job already ended and every event was delivered
                    if saw_terminal {
                        debug!(error = %e, "Connection dropped after the terminal event");
                        return Ok(StreamEnd::Terminal);
                    }
                    return Err(ClientError::Transport(e));
                }
                None => break,
            }
        }

        if saw_terminal {
            Ok(StreamEnd::Terminal)
        } else {
            if decoder.pending_bytes() > 0 {
                warn!(
                    pending = decoder.pending_bytes(),
                    "Stream closed mid-record"
                );
            }
            Err(ClientError::StreamEndedEarly)
        }
    }
}

fn api_error(status_code: u16, body: Option<ErrorBody>) -> ClientError {
    match body {
        Some(body) => ClientError::Api {
            message: body.error.message,
            code: body.error.code,
            status_code,
        },
        None => ClientError::Api {
            message: "Request rejected".to_string(),
            code: "UNKNOWN".to_string(),
            status_code,
        },
    }
}
