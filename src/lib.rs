//! # Dobchange (Birthdate Change Relay)
//!
//! `dobchange` is a small HTTP service that changes the birthdate on a Roblox account
//! on behalf of a caller who supplies their own session cookie and password.
//!
//! Roblox guards the birthdate field with a step-up **challenge**: the first mutation
//! attempt is answered with `403` plus three `rblx-challenge-*` headers, and the change
//! only sticks once the challenge is continued, the password is re-verified, and the
//! challenge is completed with the resulting verification token.
//!
//! ## Flow
//!
//! 1. Fetch a CSRF token from `users.roblox.com/v1/birthdate`.
//! 2. Submit the new date. `200` ends the flow early (no challenge required).
//! 3. Read the challenge id, type and metadata from the `403` response headers.
//! 4. Continue the challenge and decode the nested metadata (`userId`, inner `challengeId`).
//! 5. Verify the password against the user-scoped two-step endpoint.
//! 6. Complete the challenge with the metadata plus `verificationToken`.
//! 7. Resubmit the date and require `200` (see [`challenge::CompletionMode`]).
//!
//! Every invocation is independent: nothing is cached or persisted between requests,
//! and no step is ever retried. Callers always get back the step log, so a failure
//! shows exactly how far the sequence progressed.

pub mod api;
pub mod challenge;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
