//! Correlation state machine.
//!
//! Flow Overview:
//! 1) `issue_challenge` reserves a unique code, stores a pending session and
//!    writes an audit row.
//! 2) `handle_chat_message` claims a live, unclaimed code for the sender. It
//!    never touches sessions.
//! 3) `poll_session` promotes a pending session once its code is claimed.
//!
//! Session states are `NoSession`, `Pending`, `Claimed-Unseen` and
//! `Verified`. The only transition is Pending to Verified, taken lazily by the
//! next poll after a claim.

use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use super::code::{valid_code, Code};
use super::error::VerifyError;
use super::model::{CodeSlot, Identity, Session};
use super::store::VerificationStore;
use crate::backend::IdentityBackend;
use crate::chat::ChatMessage;

const DEFAULT_TTL_SECONDS: u64 = 300;
const UUID_ATTEMPTS: usize = 8;
const ROOM_URL_PREFIX: &str = "https://live.bilibili.com/";

/// Produces candidate codes; uniqueness is checked against the store.
pub type CodeSource = Arc<dyn Fn() -> Code + Send + Sync>;

#[derive(Clone, Debug)]
pub struct CorrelatorConfig {
    room_id: u64,
    ttl: Duration,
}

impl CorrelatorConfig {
    #[must_use]
    pub fn new(room_id: u64) -> Self {
        Self {
            room_id,
            ttl: Duration::from_secs(DEFAULT_TTL_SECONDS),
        }
    }

    /// Sliding TTL applied to both sessions and code slots.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn room_url(&self) -> String {
        format!("{ROOM_URL_PREFIX}{}", self.room_id)
    }
}

/// What a caller needs to complete a verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub code: Code,
    pub session_id: Uuid,
    pub room_id: u64,
    pub room_url: String,
    pub instructions: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The message claimed a live code.
    Claimed,
    /// The message names a code some earlier message already claimed.
    AlreadyClaimed,
    /// The text is not a live code.
    NoMatch,
}

pub struct Correlator {
    store: Arc<dyn VerificationStore>,
    backend: Arc<dyn IdentityBackend>,
    config: CorrelatorConfig,
    codes: CodeSource,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Correlator {
    #[must_use]
    pub fn new(
        store: Arc<dyn VerificationStore>,
        backend: Arc<dyn IdentityBackend>,
        config: CorrelatorConfig,
    ) -> Self {
        Self {
            store,
            backend,
            config,
            codes: Arc::new(|| Code::generate(&mut rand::thread_rng())),
        }
    }

    /// Replace the random code generator, e.g. to pin codes in tests.
    #[must_use]
    pub fn with_code_source(mut self, codes: CodeSource) -> Self {
        self.codes = codes;
        self
    }

    #[must_use]
    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Mint a code and session for `caller` and record the audit row.
    ///
    /// # Errors
    /// [`VerifyError::Server`] if no session id can be generated or the audit
    /// row cannot be written. In the latter case the in-memory challenge is
    /// kept.
    pub async fn issue_challenge(&self, caller: &str) -> Result<Challenge, VerifyError> {
        let ttl = self.config.ttl;
        let session_id = random_uuid()?;

        let code = loop {
            let candidate = (self.codes)();
            if self
                .store
                .insert_code_if_absent(candidate.clone(), CodeSlot::Unclaimed, ttl)
            {
                break candidate;
            }
            trace!(code = %candidate, "code collision, resampling");
        };

        self.store
            .put_session(session_id, Session::pending(code.clone()), ttl);

        if let Err(err) = self
            .backend
            .insert_audit_row(caller, code.as_str(), session_id)
            .await
        {
            error!(%session_id, "failed to persist verification audit row: {err:#}");
            return Err(VerifyError::Server);
        }

        let room_url = self.config.room_url();
        Ok(Challenge {
            instructions: format!("Open {room_url} and send this chat message in the room: {code}"),
            code,
            session_id,
            room_id: self.config.room_id,
            room_url,
        })
    }

    /// Try to claim the code named by a chat message. Unknown text and
    /// repeated claims are discarded.
    pub async fn handle_chat_message(&self, message: &ChatMessage) -> MatchOutcome {
        let text = message.text.trim();
        if !valid_code(text) {
            trace!("chat message is not shaped like a code");
            return MatchOutcome::NoMatch;
        }
        match self.store.get_code(text) {
            None => {
                trace!("chat message is not a live code");
                MatchOutcome::NoMatch
            }
            Some(CodeSlot::Claimed(_)) => MatchOutcome::AlreadyClaimed,
            Some(CodeSlot::Unclaimed) => {
                let claimed = CodeSlot::Claimed(message.sender.clone());
                if !self.store.compare_and_swap_code(
                    text,
                    &CodeSlot::Unclaimed,
                    claimed,
                    self.config.ttl,
                ) {
                    return MatchOutcome::AlreadyClaimed;
                }
                info!(code = text, uid = message.sender.uid, "verify code claimed");

                // Only the swap winner gets here, so at most one bind per code.
                match self
                    .backend
                    .bind_uid_if_unbound(text, message.sender.uid)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!(code = text, "no unbound audit row for claimed code"),
                    Err(err) => error!(code = text, "failed to persist uid binding: {err:#}"),
                }
                MatchOutcome::Claimed
            }
        }
    }

    /// Resolve a session to its claimant.
    ///
    /// # Errors
    /// - [`VerifyError::EmptyQuery`] for an empty id, before any lookup.
    /// - [`VerifyError::NotFound`] if the session is unknown or expired.
    /// - [`VerifyError::NotUsed`] while the code is unclaimed or after it
    ///   expired unclaimed.
    pub fn poll_session(&self, query_id: &str) -> Result<Identity, VerifyError> {
        let query_id = query_id.trim();
        if query_id.is_empty() {
            return Err(VerifyError::EmptyQuery);
        }
        let session_id = Uuid::parse_str(query_id).map_err(|_| VerifyError::NotFound)?;
        let session = self
            .store
            .get_session(&session_id)
            .ok_or(VerifyError::NotFound)?;

        if session.verified() {
            return session.claimant().cloned().ok_or(VerifyError::Server);
        }

        // Polling must not keep an unclaimed code alive past its own TTL.
        match self.store.peek_code(session.code().as_str()) {
            None | Some(CodeSlot::Unclaimed) => Err(VerifyError::NotUsed),
            Some(CodeSlot::Claimed(identity)) => {
                self.store.put_session(
                    session_id,
                    Session::resolved(session.code().clone(), identity.clone()),
                    self.config.ttl,
                );
                Ok(identity)
            }
        }
    }
}

/// Random v4 UUID from the OS generator, retried a bounded number of times.
///
/// # Errors
/// [`VerifyError::Server`] if the random source keeps failing.
pub fn random_uuid() -> Result<Uuid, VerifyError> {
    for attempt in 1..=UUID_ATTEMPTS {
        let mut bytes = [0u8; 16];
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => return Ok(uuid::Builder::from_random_bytes(bytes).into_uuid()),
            Err(err) => warn!(attempt, "failed to read random bytes: {err}"),
        }
    }
    Err(VerifyError::Server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFuture, MemoryBackend, UserRecord};
    use crate::verify::clock::ManualClock;
    use crate::verify::store::MemoryStore;
    use anyhow::{anyhow, Context, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    const TTL: Duration = Duration::from_secs(300);

    struct FailingBackend {
        binds: AtomicUsize,
    }

    impl IdentityBackend for FailingBackend {
        fn find_user_by_external_id<'a>(
            &'a self,
            _node_id: &'a str,
        ) -> BackendFuture<'a, Option<UserRecord>> {
            Box::pin(async { Err(anyhow!("backend down")) })
        }

        fn find_user_by_session_token<'a>(
            &'a self,
            _token: &'a str,
        ) -> BackendFuture<'a, Option<UserRecord>> {
            Box::pin(async { Err(anyhow!("backend down")) })
        }

        fn insert_user<'a>(&'a self, _user: &'a UserRecord) -> BackendFuture<'a, ()> {
            Box::pin(async { Err(anyhow!("backend down")) })
        }

        fn insert_audit_row<'a>(
            &'a self,
            _caller: &'a str,
            _code: &'a str,
            _session_id: Uuid,
        ) -> BackendFuture<'a, ()> {
            Box::pin(async { Err(anyhow!("backend down")) })
        }

        fn bind_uid_if_unbound<'a>(&'a self, _code: &'a str, _uid: i64) -> BackendFuture<'a, bool> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(anyhow!("backend down")) })
        }

        fn ping(&self) -> BackendFuture<'_, ()> {
            Box::pin(async { Err(anyhow!("backend down")) })
        }
    }

    /// Counts code lookups and forwards everything to a memory store.
    struct CountingStore {
        inner: MemoryStore,
        code_reads: AtomicUsize,
    }

    impl VerificationStore for CountingStore {
        fn get_session(&self, id: &Uuid) -> Option<Session> {
            self.inner.get_session(id)
        }

        fn put_session(&self, id: Uuid, session: Session, ttl: Duration) {
            self.inner.put_session(id, session, ttl);
        }

        fn get_code(&self, code: &str) -> Option<CodeSlot> {
            self.code_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_code(code)
        }

        fn peek_code(&self, code: &str) -> Option<CodeSlot> {
            self.code_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.peek_code(code)
        }

        fn put_code(&self, code: Code, slot: CodeSlot, ttl: Duration) {
            self.inner.put_code(code, slot, ttl);
        }

        fn insert_code_if_absent(&self, code: Code, slot: CodeSlot, ttl: Duration) -> bool {
            self.inner.insert_code_if_absent(code, slot, ttl)
        }

        fn compare_and_swap_code(
            &self,
            code: &str,
            expected: &CodeSlot,
            new: CodeSlot,
            ttl: Duration,
        ) -> bool {
            self.inner.compare_and_swap_code(code, expected, new, ttl)
        }

        fn purge_expired(&self) -> usize {
            self.inner.purge_expired()
        }
    }

    fn fixed_codes(codes: &[&str]) -> Result<CodeSource> {
        let queue: Vec<Code> = codes
            .iter()
            .rev()
            .map(|code| Code::parse(code).context("invalid test code"))
            .collect::<Result<_>>()?;
        let queue = Mutex::new(queue);
        Ok(Arc::new(move || {
            let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() > 1 {
                queue.pop().unwrap_or_else(|| Code::generate(&mut rand::thread_rng()))
            } else {
                queue
                    .last()
                    .cloned()
                    .unwrap_or_else(|| Code::generate(&mut rand::thread_rng()))
            }
        }))
    }

    fn setup() -> (Correlator, Arc<MemoryStore>, Arc<MemoryBackend>, ManualClock) {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let backend = Arc::new(MemoryBackend::new());
        let correlator = Correlator::new(
            store.clone(),
            backend.clone(),
            CorrelatorConfig::new(21_452_505).with_ttl(TTL),
        );
        (correlator, store, backend, clock)
    }

    fn message(text: &str, uid: i64, name: &str) -> ChatMessage {
        ChatMessage {
            text: text.to_string(),
            sender: Identity {
                uid,
                name: name.to_string(),
                medal: String::new(),
            },
        }
    }

    #[test]
    fn random_uuid_is_v4() -> Result<()> {
        let id = random_uuid().map_err(|err| anyhow!("{err}"))?;
        assert_eq!(id.get_version_num(), 4);
        Ok(())
    }

    #[test]
    fn room_url_uses_room_id() {
        let config = CorrelatorConfig::new(7);
        assert_eq!(config.room_url(), "https://live.bilibili.com/7");
        assert_eq!(config.ttl(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn issue_then_poll_is_not_used() -> Result<()> {
        let (correlator, _store, backend, _clock) = setup();
        let challenge = correlator.issue_challenge("caller").await?;

        assert!(valid_code(challenge.code.as_str()));
        assert!(challenge.instructions.contains(challenge.code.as_str()));
        assert!(challenge.instructions.contains(&challenge.room_url));
        assert_eq!(
            correlator.poll_session(&challenge.session_id.to_string()),
            Err(VerifyError::NotUsed)
        );

        let rows = backend.audit_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].caller, "caller");
        assert_eq!(rows[0].session_id, challenge.session_id);
        Ok(())
    }

    #[tokio::test]
    async fn claim_then_poll_resolves_idempotently() -> Result<()> {
        let (correlator, _store, backend, _clock) = setup();
        let correlator = correlator.with_code_source(fixed_codes(&["AB12CD34"])?);
        let challenge = correlator.issue_challenge("caller").await?;
        let session = challenge.session_id.to_string();

        let outcome = correlator
            .handle_chat_message(&message("AB12CD34", 42, "alice"))
            .await;
        assert_eq!(outcome, MatchOutcome::Claimed);

        let first = correlator.poll_session(&session).map_err(|e| anyhow!("{e}"))?;
        let second = correlator.poll_session(&session).map_err(|e| anyhow!("{e}"))?;
        assert_eq!(first.uid, 42);
        assert_eq!(first.name, "alice");
        assert_eq!(first, second);
        assert_eq!(backend.audit_rows()[0].bili_uid, 42);
        Ok(())
    }

    #[tokio::test]
    async fn second_claim_is_ignored() -> Result<()> {
        let (correlator, _store, backend, _clock) = setup();
        let correlator = correlator.with_code_source(fixed_codes(&["AB12CD34"])?);
        let challenge = correlator.issue_challenge("caller").await?;

        correlator
            .handle_chat_message(&message("AB12CD34", 42, "alice"))
            .await;
        let outcome = correlator
            .handle_chat_message(&message("AB12CD34", 7, "mallory"))
            .await;
        assert_eq!(outcome, MatchOutcome::AlreadyClaimed);

        let claimant = correlator
            .poll_session(&challenge.session_id.to_string())
            .map_err(|e| anyhow!("{e}"))?;
        assert_eq!(claimant.uid, 42);
        assert_eq!(backend.audit_rows()[0].bili_uid, 42);
        Ok(())
    }

    #[tokio::test]
    async fn chat_text_is_trimmed_and_case_sensitive() -> Result<()> {
        let (correlator, _store, _backend, _clock) = setup();
        let correlator = correlator.with_code_source(fixed_codes(&["AB12CD34"])?);
        correlator.issue_challenge("caller").await?;

        assert_eq!(
            correlator
                .handle_chat_message(&message("ab12cd34", 1, "lower"))
                .await,
            MatchOutcome::NoMatch
        );
        assert_eq!(
            correlator
                .handle_chat_message(&message("  AB12CD34 \n", 2, "padded"))
                .await,
            MatchOutcome::Claimed
        );
        Ok(())
    }

    #[tokio::test]
    async fn colliding_codes_are_resampled() -> Result<()> {
        let (correlator, _store, _backend, _clock) = setup();
        let correlator =
            correlator.with_code_source(fixed_codes(&["AAAAAAAA", "AAAAAAAA", "BBBBBBBB"])?);
        let first = correlator.issue_challenge("caller").await?;
        let second = correlator.issue_challenge("caller").await?;
        assert_eq!(first.code.as_str(), "AAAAAAAA");
        assert_eq!(second.code.as_str(), "BBBBBBBB");
        Ok(())
    }

    #[test]
    fn empty_and_unknown_queries() {
        let (correlator, _store, _backend, _clock) = setup();
        assert_eq!(correlator.poll_session(""), Err(VerifyError::EmptyQuery));
        assert_eq!(correlator.poll_session("   "), Err(VerifyError::EmptyQuery));
        assert_eq!(
            correlator.poll_session("not-a-uuid"),
            Err(VerifyError::NotFound)
        );
        assert_eq!(
            correlator.poll_session(&Uuid::new_v4().to_string()),
            Err(VerifyError::NotFound)
        );
    }

    #[tokio::test]
    async fn expired_code_stays_not_used_until_session_expires() -> Result<()> {
        let (correlator, store, _backend, clock) = setup();
        let correlator = correlator.with_code_source(fixed_codes(&["AB12CD34"])?);
        let challenge = correlator.issue_challenge("caller").await?;
        let session = challenge.session_id.to_string();

        // Keep the session alive with polls while the code idles out.
        for _ in 0..3 {
            clock.advance(Duration::from_secs(200));
            assert_eq!(correlator.poll_session(&session), Err(VerifyError::NotUsed));
        }
        assert!(store.get_code("AB12CD34").is_none());
        assert_eq!(
            correlator
                .handle_chat_message(&message("AB12CD34", 42, "late"))
                .await,
            MatchOutcome::NoMatch
        );

        clock.advance(Duration::from_secs(301));
        assert_eq!(correlator.poll_session(&session), Err(VerifyError::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn polling_does_not_keep_an_unclaimed_code_alive() -> Result<()> {
        let (correlator, store, _backend, clock) = setup();
        let correlator = correlator.with_code_source(fixed_codes(&["AB12CD34"])?);
        let challenge = correlator.issue_challenge("caller").await?;
        let session = challenge.session_id.to_string();

        clock.advance(Duration::from_secs(290));
        assert_eq!(correlator.poll_session(&session), Err(VerifyError::NotUsed));
        assert_eq!(store.peek_code("AB12CD34"), Some(CodeSlot::Unclaimed));

        clock.advance(Duration::from_secs(20));
        assert_eq!(store.peek_code("AB12CD34"), None);
        assert_eq!(
            correlator
                .handle_chat_message(&message("AB12CD34", 42, "late"))
                .await,
            MatchOutcome::NoMatch
        );
        assert_eq!(correlator.poll_session(&session), Err(VerifyError::NotUsed));
        Ok(())
    }

    #[tokio::test]
    async fn non_code_chat_text_skips_the_store() -> Result<()> {
        let clock = ManualClock::new();
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(Arc::new(clock)),
            code_reads: AtomicUsize::new(0),
        });
        let correlator = Correlator::new(
            store.clone(),
            Arc::new(MemoryBackend::new()),
            CorrelatorConfig::new(1),
        )
        .with_code_source(fixed_codes(&["AB12CD34"])?);
        correlator.issue_challenge("caller").await?;

        for text in ["hello", "ab12cd34", "AB12CD3", "AB12CD345", "AB12 CD34", ""] {
            assert_eq!(
                correlator.handle_chat_message(&message(text, 1, "noise")).await,
                MatchOutcome::NoMatch
            );
        }
        assert_eq!(store.code_reads.load(Ordering::SeqCst), 0);

        assert_eq!(
            correlator
                .handle_chat_message(&message("AB12CD34", 42, "alice"))
                .await,
            MatchOutcome::Claimed
        );
        assert_eq!(store.code_reads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn audit_failure_is_server_error_without_rollback() -> Result<()> {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::new(Arc::new(clock)));
        let backend = Arc::new(FailingBackend {
            binds: AtomicUsize::new(0),
        });
        let correlator = Correlator::new(store.clone(), backend, CorrelatorConfig::new(1))
            .with_code_source(fixed_codes(&["AB12CD34"])?);

        assert_eq!(
            correlator.issue_challenge("caller").await,
            Err(VerifyError::Server)
        );
        assert_eq!(store.get_code("AB12CD34"), Some(CodeSlot::Unclaimed));
        Ok(())
    }

    #[tokio::test]
    async fn bind_failure_keeps_in_memory_claim() -> Result<()> {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::new(Arc::new(clock)));
        let backend = Arc::new(FailingBackend {
            binds: AtomicUsize::new(0),
        });
        let correlator = Correlator::new(store.clone(), backend.clone(), CorrelatorConfig::new(1));
        let code = Code::parse("AB12CD34").context("invalid test code")?;
        store.put_code(code.clone(), CodeSlot::Unclaimed, TTL);

        let outcome = correlator
            .handle_chat_message(&message("AB12CD34", 42, "alice"))
            .await;
        assert_eq!(outcome, MatchOutcome::Claimed);
        assert_eq!(backend.binds.load(Ordering::SeqCst), 1);
        assert!(matches!(
            store.get_code("AB12CD34"),
            Some(CodeSlot::Claimed(identity)) if identity.uid == 42
        ));
        Ok(())
    }
}
