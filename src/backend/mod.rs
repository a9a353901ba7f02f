//! Identity backend: durable user records and the challenge audit trail.
//!
//! The correlator never depends on this for interactive answers. Issuance
//! fails if the audit row cannot be written; a failed uid binding after a
//! claim is only logged.

mod memory;
mod postgres;

pub use memory::{AuditRow, MemoryBackend};
pub use postgres::PgBackend;

use anyhow::Result;
use secrecy::SecretString;
use std::{future::Future, pin::Pin};
use uuid::Uuid;

/// `bili_uid` value of an audit row whose code has not been claimed.
pub const UNBOUND_UID: i64 = -1;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A user registered through OAuth login.
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Random UUID handed to the user; presented back as the session token.
    pub uuid: String,
    pub name: String,
    pub email: String,
    pub access_token: SecretString,
    /// Stable id of the account at the OAuth provider.
    pub node_id: String,
}

pub trait IdentityBackend: Send + Sync {
    fn find_user_by_external_id<'a>(&'a self, node_id: &'a str)
        -> BackendFuture<'a, Option<UserRecord>>;

    fn find_user_by_session_token<'a>(
        &'a self,
        token: &'a str,
    ) -> BackendFuture<'a, Option<UserRecord>>;

    fn insert_user<'a>(&'a self, user: &'a UserRecord) -> BackendFuture<'a, ()>;

    fn insert_audit_row<'a>(
        &'a self,
        caller: &'a str,
        code: &'a str,
        session_id: Uuid,
    ) -> BackendFuture<'a, ()>;

    /// Record the claiming uid for `code` unless one is already recorded.
    /// Returns whether a row was updated.
    fn bind_uid_if_unbound<'a>(&'a self, code: &'a str, uid: i64) -> BackendFuture<'a, bool>;

    fn ping(&self) -> BackendFuture<'_, ()>;
}
