//! bvm-client - stream consumer for the Brand Visibility Monitor
//!
//! Opens the analysis event stream, reconstructs a consistent progress
//! picture across the prompt × provider matrix, and triggers exactly-once
//! finalize side effects (persist result, refresh credits) when the job ends.

pub mod dispatcher;
pub mod error;
pub mod session;
pub mod stream;

pub use crate::dispatcher::{Dispatcher, JobSnapshot, JobStatus, SideEffect};
pub use crate::error::ClientError;
pub use crate::session::{AnalysisSession, FinalizeLatch, SessionOutcome};
pub use crate::stream::{StreamEnd, StreamReader};
