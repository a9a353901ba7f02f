use crate::{
    api::{self, ServerConfig},
    cli::telemetry,
    verify::RateLimitConfig,
};
use anyhow::Result;
use secrecy::SecretString;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub room_id: u64,
    pub base_url: String,
    pub require_auth: bool,
    pub github: Option<(String, SecretString)>,
    pub ingest_token: Option<SecretString>,
    pub code_ttl_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub global_rate: f64,
    pub global_burst: u32,
    pub user_rate: f64,
    pub user_burst: u32,
    pub user_idle_seconds: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let rate_limit = RateLimitConfig::new()
            .with_global(self.global_rate, self.global_burst)
            .with_caller(self.user_rate, self.user_burst)
            .with_caller_idle(Duration::from_secs(self.user_idle_seconds));

        let mut config = ServerConfig::new(self.port, self.room_id)
            .with_dsn(self.dsn)
            .with_base_url(self.base_url)
            .with_require_auth(self.require_auth)
            .with_ingest_token(self.ingest_token)
            .with_code_ttl(Duration::from_secs(self.code_ttl_seconds))
            .with_reaper_interval(Duration::from_secs(self.reaper_interval_seconds))
            .with_rate_limit(rate_limit);

        if let Some((client_id, client_secret)) = self.github {
            config = config.with_github(client_id, client_secret);
        }
        config
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the backend cannot be reached or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let config = args.into_config();
    debug!(
        port = config.port(),
        require_auth = config.require_auth(),
        "starting server"
    );

    let result = api::new(config).await;

    telemetry::shutdown_tracer();

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_map_to_server_config() {
        let args = Args {
            port: 9000,
            dsn: None,
            room_id: 7,
            base_url: "https://verify.example".to_string(),
            require_auth: true,
            github: Some(("id".to_string(), SecretString::from("secret".to_string()))),
            ingest_token: None,
            code_ttl_seconds: 300,
            reaper_interval_seconds: 600,
            global_rate: 1000.0,
            global_burst: 1000,
            user_rate: 50.0,
            user_burst: 50,
            user_idle_seconds: 60,
        };
        let config = args.into_config();
        assert_eq!(config.port(), 9000);
        assert!(config.require_auth());
        assert_eq!(config.base_url(), "https://verify.example");
    }
}
