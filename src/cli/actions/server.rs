use crate::{
    api,
    challenge::{CompletionMode, Endpoints, Orchestrator, UpstreamClient, UpstreamConfig},
};
use anyhow::{Context, Result};
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub users_url: String,
    pub challenge_url: String,
    pub two_step_url: String,
    pub proxy: Option<String>,
    pub completion_mode: CompletionMode,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the upstream client cannot be built or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let client = UpstreamClient::new(UpstreamConfig {
        endpoints: Endpoints {
            users: args.users_url,
            challenge: args.challenge_url,
            two_step: args.two_step_url,
        },
        proxy: args.proxy,
    })
    .context("Could not build upstream client")?;

    api::new(args.port, Orchestrator::new(client, args.completion_mode)).await
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("users_url", args.users_url.clone()),
        ("challenge_url", args.challenge_url.clone()),
        ("two_step_url", args.two_step_url.clone()),
        (
            "proxy",
            args.proxy
                .as_deref()
                .map_or_else(|| "none".to_string(), redact_proxy),
        ),
        ("completion_mode", args.completion_mode.to_string()),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_proxy(proxy: &str) -> String {
    match Url::parse(proxy) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-proxy".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn banner() -> String {
    BANNER.replace(
        "{VERSION}",
        &format!(
            "{} - {}",
            env!("CARGO_PKG_VERSION"),
            short_commit(crate::GIT_COMMIT_HASH)
        ),
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}

const BANNER: &str = r"
  .------------.
  | DD/MM/YYYY |  dobchange {VERSION}
  '------------'";
