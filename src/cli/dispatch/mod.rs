//! Command-line argument dispatch.
//!
//! Maps validated CLI matches to an [`Action`] carrying the full server
//! configuration.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{auth, verify, ARG_BASE_URL, ARG_DSN, ARG_PORT, ARG_ROOM_ID};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let room_id = matches
        .get_one::<u64>(ARG_ROOM_ID)
        .copied()
        .context("missing required argument: --room-id")?;
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .filter(|dsn| !dsn.is_empty())
        .cloned();
    let base_url = matches
        .get_one::<String>(ARG_BASE_URL)
        .cloned()
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    url::Url::parse(&base_url).with_context(|| format!("invalid --base-url: {base_url}"))?;

    let verify_opts = verify::Options::parse(matches)?;
    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        room_id,
        base_url,
        require_auth: auth_opts.require_auth,
        github: auth_opts.github,
        ingest_token: auth_opts.ingest_token,
        code_ttl_seconds: verify_opts.code_ttl_seconds,
        reaper_interval_seconds: verify_opts.reaper_interval_seconds,
        global_rate: verify_opts.global_rate,
        global_burst: verify_opts.global_burst,
        user_rate: verify_opts.user_rate,
        user_burst: verify_opts.user_burst,
        user_idle_seconds: verify_opts.user_idle_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    const CLEAN: [(&str, Option<&str>); 6] = [
        ("DANMAKU_VERIFY_DSN", None),
        ("DANMAKU_VERIFY_BASE_URL", None),
        ("DANMAKU_VERIFY_REQUIRE_AUTH", None),
        ("DANMAKU_VERIFY_GITHUB_CLIENT_ID", None),
        ("DANMAKU_VERIFY_GITHUB_CLIENT_SECRET", None),
        ("DANMAKU_VERIFY_INGEST_TOKEN", None),
    ];

    #[test]
    fn server_action_from_args() -> Result<()> {
        temp_env::with_vars(CLEAN, || -> Result<()> {
            let matches = commands::new().try_get_matches_from([
                "danmaku-verify",
                "--room-id",
                "42",
                "--port",
                "9000",
                "--user-burst",
                "3",
            ])?;
            let Action::Server(args) = handler(&matches)?;
            assert_eq!(args.port, 9000);
            assert_eq!(args.room_id, 42);
            assert_eq!(args.dsn, None);
            assert_eq!(args.user_burst, 3);
            assert!(!args.require_auth);
            Ok(())
        })
    }

    #[test]
    fn require_auth_without_credentials_fails() -> Result<()> {
        temp_env::with_vars(CLEAN, || -> Result<()> {
            let matches = commands::new().try_get_matches_from([
                "danmaku-verify",
                "--room-id",
                "42",
                "--require-auth",
            ])?;
            assert!(handler(&matches).is_err());
            Ok(())
        })
    }

    #[test]
    fn invalid_base_url_fails() -> Result<()> {
        temp_env::with_vars(CLEAN, || -> Result<()> {
            let matches = commands::new().try_get_matches_from([
                "danmaku-verify",
                "--room-id",
                "42",
                "--base-url",
                "not a url",
            ])?;
            assert!(handler(&matches).is_err());
            Ok(())
        })
    }
}
