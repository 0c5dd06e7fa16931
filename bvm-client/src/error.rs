//! Error types for bvm-client

use thiserror::Error;

/// Client-side failures around the event stream
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection-level failure (refused, reset, mid-stream drop)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response before streaming started
    #[error("{message} ({code}, status {status_code})")]
    Api {
        message: String,
        code: String,
        status_code: u16,
    },

    /// Clean stream end with no terminal `complete`/`error` event
    #[error("Stream ended before a terminal event")]
    StreamEndedEarly,
}
