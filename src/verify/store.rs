//! Dual-keyspace TTL cache holding all correlation state.
//!
//! Flow Overview:
//! 1) Sessions are keyed by session id, code slots by code string.
//! 2) Every entry carries its own TTL; a successful `get` pushes expiry
//!    forward. `peek_code` reads without touching the expiry.
//! 3) Expired entries read as absent. There is no "expired" vs "never existed".
//! 4) Code slots support compare-and-swap so a claim happens at most once.
//!
//! State is process-local and not durable.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;
use uuid::Uuid;

use super::clock::Clock;
use super::code::Code;
use super::model::{CodeSlot, Session};

pub trait VerificationStore: Send + Sync {
    fn get_session(&self, id: &Uuid) -> Option<Session>;

    fn put_session(&self, id: Uuid, session: Session, ttl: Duration);

    fn get_code(&self, code: &str) -> Option<CodeSlot>;

    /// Read a code slot without extending its expiry.
    fn peek_code(&self, code: &str) -> Option<CodeSlot>;

    fn put_code(&self, code: Code, slot: CodeSlot, ttl: Duration);

    /// Store `slot` only if no live entry exists under `code`.
    /// Returns `false` when the code is already taken.
    fn insert_code_if_absent(&self, code: Code, slot: CodeSlot, ttl: Duration) -> bool;

    /// Replace the slot under `code` with `new` only if it currently equals
    /// `expected`. Absent or expired entries never match.
    fn compare_and_swap_code(
        &self,
        code: &str,
        expected: &CodeSlot,
        new: CodeSlot,
        ttl: Duration,
    ) -> bool;

    /// Drop expired entries from both keyspaces, returning how many went.
    fn purge_expired(&self) -> usize;
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    ttl: Duration,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn new(value: V, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            ttl,
            expires_at: now + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn touch(&mut self, now: Instant) {
        self.expires_at = now + self.ttl;
    }
}

#[derive(Debug)]
struct Keyspace<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> Keyspace<K, V> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get<Q>(&self, key: &Q, now: Instant) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut entries = self.lock();
        let live = entries.get(key).is_some_and(|entry| entry.is_live(now));
        if !live {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key).map(|entry| {
            entry.touch(now);
            entry.value.clone()
        })
    }

    fn peek<Q>(&self, key: &Q, now: Instant) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    fn put(&self, key: K, value: V, ttl: Duration, now: Instant) {
        self.lock().insert(key, Entry::new(value, ttl, now));
    }

    fn insert_if_absent(&self, key: K, value: V, ttl: Duration, now: Instant) -> bool {
        let mut entries = self.lock();
        if entries.get(&key).is_some_and(|entry| entry.is_live(now)) {
            return false;
        }
        entries.insert(key, Entry::new(value, ttl, now));
        true
    }

    fn purge(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

impl<K: Eq + Hash, V: Clone + PartialEq> Keyspace<K, V> {
    fn compare_and_swap<Q>(&self, key: &Q, expected: &V, new: V, ttl: Duration, now: Instant) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == *expected => {
                entry.value = new;
                entry.ttl = ttl;
                entry.touch(now);
                true
            }
            _ => false,
        }
    }
}

/// In-memory [`VerificationStore`]. One instance is built at startup and
/// shared by reference with the correlator and the chat ingestor.
#[derive(Debug)]
pub struct MemoryStore {
    sessions: Keyspace<Uuid, Session>,
    codes: Keyspace<String, CodeSlot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Keyspace::new(),
            codes: Keyspace::new(),
            clock,
        }
    }

    /// Number of entries currently held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len() + self.codes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VerificationStore for MemoryStore {
    fn get_session(&self, id: &Uuid) -> Option<Session> {
        self.sessions.get(id, self.clock.now())
    }

    fn put_session(&self, id: Uuid, session: Session, ttl: Duration) {
        self.sessions.put(id, session, ttl, self.clock.now());
    }

    fn get_code(&self, code: &str) -> Option<CodeSlot> {
        self.codes.get(code, self.clock.now())
    }

    fn peek_code(&self, code: &str) -> Option<CodeSlot> {
        self.codes.peek(code, self.clock.now())
    }

    fn put_code(&self, code: Code, slot: CodeSlot, ttl: Duration) {
        self.codes
            .put(code.as_str().to_string(), slot, ttl, self.clock.now());
    }

    fn insert_code_if_absent(&self, code: Code, slot: CodeSlot, ttl: Duration) -> bool {
        self.codes
            .insert_if_absent(code.as_str().to_string(), slot, ttl, self.clock.now())
    }

    fn compare_and_swap_code(
        &self,
        code: &str,
        expected: &CodeSlot,
        new: CodeSlot,
        ttl: Duration,
    ) -> bool {
        self.codes
            .compare_and_swap(code, expected, new, ttl, self.clock.now())
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.sessions.purge(now) + self.codes.purge(now)
    }
}

/// Periodically sweep expired entries. Lookups stay correct without it; the
/// sweep only bounds memory held by abandoned challenges.
pub fn spawn_reaper(store: Arc<dyn VerificationStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged, "purged expired verification entries");
            }
        }
    })
}
