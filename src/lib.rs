//! # Danmaku Verify (live-room ownership verification)
//!
//! `danmaku-verify` proves that a caller controls an account on a live-streaming
//! platform. The caller asks for a challenge, receives a short code, and sends
//! that code as a chat message in the monitored room. The chat event and the
//! caller's poll arrive on unrelated channels; the correlator joins them.
//!
//! ## Correlation
//!
//! - **Codes:** 8 characters from `[0-9A-Z]`, unique among live codes.
//! - **Sessions:** each challenge gets a random UUID the caller polls with.
//! - **Claims:** the first chat message carrying a live code binds the sender
//!   to that code. Later messages with the same text are ignored.
//! - **Resolution:** a poll promotes its session to verified once the code has
//!   been claimed. Promotion is lazy, so chat ingestion never touches sessions.
//!
//! All correlation state lives in memory with a sliding TTL and is lost on
//! restart. The identity backend only keeps an audit trail.
//!
//! ## Admission
//!
//! Every verify call passes a global token bucket and then a per-caller bucket.
//! Both tiers answer with the same `rate limited` signal.

pub mod api;
pub mod backend;
pub mod chat;
pub mod cli;
pub mod oauth;
pub mod verify;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
