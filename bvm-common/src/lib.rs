//! bvm-common - shared types for the Brand Visibility Monitor
//!
//! Provides the event model, progress matrix, SSE frame codec and API wire
//! types shared between bvm-server and bvm-client.

pub mod api;
pub mod error;
pub mod events;
pub mod progress;
pub mod sse;

pub use error::{Error, Result};
