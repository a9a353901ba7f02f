use clap::{Arg, Command};

pub const ARG_CODE_TTL_SECONDS: &str = "code-ttl-seconds";
pub const ARG_REAPER_INTERVAL_SECONDS: &str = "reaper-interval-seconds";
pub const ARG_GLOBAL_RATE: &str = "global-rate";
pub const ARG_GLOBAL_BURST: &str = "global-burst";
pub const ARG_USER_RATE: &str = "user-rate";
pub const ARG_USER_BURST: &str = "user-burst";
pub const ARG_USER_IDLE_SECONDS: &str = "user-idle-seconds";

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub code_ttl_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub global_rate: f64,
    pub global_burst: u32,
    pub user_rate: f64,
    pub user_burst: u32,
    pub user_idle_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if a rate is not a positive number.
    pub fn parse(matches: &clap::ArgMatches) -> anyhow::Result<Self> {
        let u64_arg =
            |name: &str, default: u64| matches.get_one::<u64>(name).copied().unwrap_or(default);
        let u32_arg =
            |name: &str, default: u32| matches.get_one::<u32>(name).copied().unwrap_or(default);
        let rate_arg = |name: &str, default: f64| -> anyhow::Result<f64> {
            let rate = matches.get_one::<f64>(name).copied().unwrap_or(default);
            if rate.is_finite() && rate > 0.0 {
                Ok(rate)
            } else {
                Err(anyhow::anyhow!("--{name} must be a positive number, got {rate}"))
            }
        };

        Ok(Self {
            code_ttl_seconds: u64_arg(ARG_CODE_TTL_SECONDS, 300),
            reaper_interval_seconds: u64_arg(ARG_REAPER_INTERVAL_SECONDS, 600),
            global_rate: rate_arg(ARG_GLOBAL_RATE, 1000.0)?,
            global_burst: u32_arg(ARG_GLOBAL_BURST, 1000),
            user_rate: rate_arg(ARG_USER_RATE, 50.0)?,
            user_burst: u32_arg(ARG_USER_BURST, 50),
            user_idle_seconds: u64_arg(ARG_USER_IDLE_SECONDS, 60),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CODE_TTL_SECONDS)
                .long("code-ttl-seconds")
                .help("Sliding TTL of verify codes and sessions, in seconds")
                .env("DANMAKU_VERIFY_CODE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REAPER_INTERVAL_SECONDS)
                .long("reaper-interval-seconds")
                .help("How often expired codes and sessions are swept, in seconds")
                .env("DANMAKU_VERIFY_REAPER_INTERVAL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_GLOBAL_RATE)
                .long("global-rate")
                .help("Requests per second admitted across all callers")
                .env("DANMAKU_VERIFY_GLOBAL_RATE")
                .default_value("1000")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_GLOBAL_BURST)
                .long("global-burst")
                .help("Burst size of the global bucket")
                .env("DANMAKU_VERIFY_GLOBAL_BURST")
                .default_value("1000")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_USER_RATE)
                .long("user-rate")
                .help("Requests per second admitted per caller")
                .env("DANMAKU_VERIFY_USER_RATE")
                .default_value("50")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_USER_BURST)
                .long("user-burst")
                .help("Burst size of each caller bucket")
                .env("DANMAKU_VERIFY_USER_BURST")
                .default_value("50")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_USER_IDLE_SECONDS)
                .long("user-idle-seconds")
                .help("Seconds after which an idle caller bucket is forgotten")
                .env("DANMAKU_VERIFY_USER_IDLE_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
