//! Core domain model types for reconflow.
//!
//! This module contains the fundamental types used throughout the framework:
//! - Stage state and attempt outcome enums
//! - Execution attempt records

mod attempt;
mod status;

pub use attempt::ExecutionAttempt;
pub use status::{AttemptOutcome, StageState};
