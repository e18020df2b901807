use crate::cli::{
    actions::{Action, server::Args},
    commands::{ARG_PORT, upstream},
};
use anyhow::Result;

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(5000);
    let upstream = upstream::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        users_url: upstream.users_url,
        challenge_url: upstream.challenge_url,
        two_step_url: upstream.two_step_url,
        proxy: upstream.proxy,
        completion_mode: upstream.completion_mode,
    }))
}
