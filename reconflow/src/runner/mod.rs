//! Command runner: spawning external processes and classifying their outcome.

mod classify;
mod command;
mod process;

pub use classify::{Classification, FailureClassifier, FailureSignature, STACK_BUFFER_OVERRUN};
pub use command::{CommandLine, ExecutionResult};
pub use process::{CommandRunner, ProcessRunner};
