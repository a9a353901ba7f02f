use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use secrecy::SecretString;

pub const ARG_REQUIRE_AUTH: &str = "require-auth";
pub const ARG_GITHUB_CLIENT_ID: &str = "github-client-id";
pub const ARG_GITHUB_CLIENT_SECRET: &str = "github-client-secret";
pub const ARG_INGEST_TOKEN: &str = "ingest-token";

#[derive(Debug, Clone)]
pub struct Options {
    pub require_auth: bool,
    pub github: Option<(String, SecretString)>,
    pub ingest_token: Option<SecretString>,
}

impl Options {
    /// # Errors
    /// Returns an error if auth is required but GitHub credentials are missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let require_auth = matches.get_flag(ARG_REQUIRE_AUTH);

        let client_id = matches
            .get_one::<String>(ARG_GITHUB_CLIENT_ID)
            .filter(|value| !value.is_empty())
            .cloned();
        let client_secret = matches
            .get_one::<String>(ARG_GITHUB_CLIENT_SECRET)
            .filter(|value| !value.is_empty())
            .map(|value| SecretString::from(value.clone()));

        let github = match (client_id, client_secret) {
            (Some(id), Some(secret)) => Some((id, secret)),
            _ if require_auth => {
                return Err(anyhow!(
                    "--{ARG_REQUIRE_AUTH} needs --{ARG_GITHUB_CLIENT_ID} and --{ARG_GITHUB_CLIENT_SECRET}"
                ))
            }
            _ => None,
        };

        let ingest_token = matches
            .get_one::<String>(ARG_INGEST_TOKEN)
            .filter(|value| !value.is_empty())
            .map(|value| SecretString::from(value.clone()));

        Ok(Self {
            require_auth,
            github,
            ingest_token,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_REQUIRE_AUTH)
                .long("require-auth")
                .help("Require a session token from GitHub login on verify calls")
                .env("DANMAKU_VERIFY_REQUIRE_AUTH")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_GITHUB_CLIENT_ID)
                .long("github-client-id")
                .help("GitHub OAuth app client id")
                .env("DANMAKU_VERIFY_GITHUB_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_GITHUB_CLIENT_SECRET)
                .long("github-client-secret")
                .help("GitHub OAuth app client secret")
                .env("DANMAKU_VERIFY_GITHUB_CLIENT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_INGEST_TOKEN)
                .long("ingest-token")
                .help("Bearer token chat relays use on POST /chat/events")
                .long_help(
                    "Bearer token chat relays use on POST /chat/events. The route is not mounted without it.",
                )
                .env("DANMAKU_VERIFY_INGEST_TOKEN")
                .hide_env_values(true),
        )
}
