//! HTTP API handlers

pub mod analyze;
pub mod credits;
pub mod health;
pub mod runs;
