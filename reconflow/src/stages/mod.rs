//! Stage actions and parameter variants.
//!
//! A stage's work is a [`StageAction`]: either an engine subcommand run
//! through the command runner ([`CommandAction`]) or an in-process library
//! call ([`CollaboratorAction`]). Each invocation receives one
//! [`ParameterVariant`].

mod action;
mod variant;

pub use action::{
    commit_output, ActionContext, ActionError, CollaboratorAction, CommandAction, StageAction,
};
pub use variant::ParameterVariant;
