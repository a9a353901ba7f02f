//! In-process identity backend, used when no database is configured.

use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use super::{BackendFuture, IdentityBackend, UserRecord, UNBOUND_UID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub caller: String,
    pub code: String,
    pub session_id: Uuid,
    pub bili_uid: i64,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    users: Mutex<HashMap<String, UserRecord>>,
    audit: Mutex<Vec<AuditRow>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every audit row written so far.
    #[must_use]
    pub fn audit_rows(&self) -> Vec<AuditRow> {
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn users(&self) -> std::sync::MutexGuard<'_, HashMap<String, UserRecord>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IdentityBackend for MemoryBackend {
    fn find_user_by_external_id<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BackendFuture<'a, Option<UserRecord>> {
        let user = self
            .users()
            .values()
            .find(|user| user.node_id == node_id)
            .cloned();
        Box::pin(async move { Ok(user) })
    }

    fn find_user_by_session_token<'a>(
        &'a self,
        token: &'a str,
    ) -> BackendFuture<'a, Option<UserRecord>> {
        let user = self.users().get(token).cloned();
        Box::pin(async move { Ok(user) })
    }

    fn insert_user<'a>(&'a self, user: &'a UserRecord) -> BackendFuture<'a, ()> {
        let result = {
            let mut users = self.users();
            if users.contains_key(&user.uuid) || users.values().any(|u| u.node_id == user.node_id)
            {
                Err(anyhow!("user already exists"))
            } else {
                users.insert(user.uuid.clone(), user.clone());
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn insert_audit_row<'a>(
        &'a self,
        caller: &'a str,
        code: &'a str,
        session_id: Uuid,
    ) -> BackendFuture<'a, ()> {
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AuditRow {
                caller: caller.to_string(),
                code: code.to_string(),
                session_id,
                bili_uid: UNBOUND_UID,
            });
        Box::pin(async { Ok(()) })
    }

    fn bind_uid_if_unbound<'a>(&'a self, code: &'a str, uid: i64) -> BackendFuture<'a, bool> {
        let mut updated = false;
        for row in self
            .audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .filter(|row| row.code == code && row.bili_uid == UNBOUND_UID)
        {
            row.bili_uid = uid;
            updated = true;
        }
        Box::pin(async move { Ok(updated) })
    }

    fn ping(&self) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
