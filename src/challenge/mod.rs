//! Birthdate change orchestration.
//!
//! [`Orchestrator::execute`] runs the fixed request sequence for one [`ChangeRequest`]
//! and always returns an [`Outcome`] carrying the [`StepLog`], whether it succeeded or not.

pub mod client;
pub mod error;
pub mod metadata;
mod orchestrator;
mod types;

pub use client::{Endpoints, UpstreamClient, UpstreamConfig};
pub use error::{ChallengeError, ChallengeStage, MutationStage};
pub use orchestrator::{
    CHALLENGE_ID_HEADER, CHALLENGE_METADATA_HEADER, CHALLENGE_TYPE_HEADER, CompletionMode,
    IMMEDIATE_SUCCESS, Orchestrator, PASSWORD_ACTION_TYPE, VERIFICATION_REQUIRED,
};
pub use types::{
    Applied, ChangeForm, ChangeRequest, Failure, Outcome, SESSION_COOKIE_PREFIX, StepLog,
    TargetDate,
};
