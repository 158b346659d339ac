//! Structured cancellation.
//!
//! A single [`CancellationToken`] is shared by the pipeline executor and the
//! command runner so that interrupting a run also terminates the external
//! process it is waiting on.

mod token;

pub use token::CancellationToken;
