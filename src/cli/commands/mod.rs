pub mod auth;
pub mod logging;
pub mod verify;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const ARG_ROOM_ID: &str = "room-id";
pub const ARG_BASE_URL: &str = "base-url";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("danmaku-verify")
        .about("Live-room chat ownership verification")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("DANMAKU_VERIFY_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .long_help(
                    "Postgres connection string. Without it users and audit rows are kept in memory and lost on restart.",
                )
                .env("DANMAKU_VERIFY_DSN"),
        )
        .arg(
            Arg::new(ARG_ROOM_ID)
                .short('r')
                .long("room-id")
                .help("Live room where verification codes must be sent")
                .env("DANMAKU_VERIFY_ROOM_ID")
                .required(true)
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_BASE_URL)
                .long("base-url")
                .help("Public base URL of this service, used for the OAuth redirect")
                .env("DANMAKU_VERIFY_BASE_URL")
                .default_value("http://localhost:8080"),
        );

    let command = verify::with_args(command);
    let command = auth::with_args(command);
    logging::with_args(command)
}
