//! Admission control for verify calls.
//!
//! Two tiers of token buckets:
//! 1) A global bucket shared by all traffic.
//! 2) One bucket per caller identity, created on first use and forgotten after
//!    an idle period.
//!
//! The per-caller tier is only consulted after the global tier admits, so a
//! globally overloaded service does not allocate caller buckets. Either tier
//! denies with the same [`RateLimitDecision::Limited`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace};

use super::clock::Clock;

const DEFAULT_GLOBAL_RATE: f64 = 1000.0;
const DEFAULT_GLOBAL_BURST: u32 = 1000;
const DEFAULT_CALLER_RATE: f64 = 50.0;
const DEFAULT_CALLER_BURST: u32 = 50;
const DEFAULT_CALLER_IDLE_SECONDS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    /// Check admission for one request. `caller` is `None` for routes that only
    /// use the global tier.
    fn check(&self, caller: Option<&str>) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _caller: Option<&str>) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

/// Lazily refilled token bucket; starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(burst: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = elapsed
            .as_secs_f64()
            .mul_add(self.refill_rate, self.tokens)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    global_rate: f64,
    global_burst: u32,
    caller_rate: f64,
    caller_burst: u32,
    caller_idle: Duration,
}

impl RateLimitConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            global_rate: DEFAULT_GLOBAL_RATE,
            global_burst: DEFAULT_GLOBAL_BURST,
            caller_rate: DEFAULT_CALLER_RATE,
            caller_burst: DEFAULT_CALLER_BURST,
            caller_idle: Duration::from_secs(DEFAULT_CALLER_IDLE_SECONDS),
        }
    }

    #[must_use]
    pub fn with_global(mut self, rate: f64, burst: u32) -> Self {
        self.global_rate = rate;
        self.global_burst = burst;
        self
    }

    #[must_use]
    pub fn with_caller(mut self, rate: f64, burst: u32) -> Self {
        self.caller_rate = rate;
        self.caller_burst = burst;
        self
    }

    #[must_use]
    pub fn with_caller_idle(mut self, idle: Duration) -> Self {
        self.caller_idle = idle;
        self
    }

    #[must_use]
    pub fn caller_idle(&self) -> Duration {
        self.caller_idle
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct CallerBucket {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Global plus per-caller token buckets.
#[derive(Debug)]
pub struct TieredRateLimiter {
    config: RateLimitConfig,
    global: Mutex<TokenBucket>,
    // Get-or-create happens under this lock, so two first requests from the
    // same caller share one bucket.
    callers: Mutex<HashMap<String, CallerBucket>>,
    clock: Arc<dyn Clock>,
}

impl TieredRateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            global: Mutex::new(TokenBucket::new(
                config.global_burst,
                config.global_rate,
                now,
            )),
            callers: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    fn check_global(&self, now: Instant) -> bool {
        self.global
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire(now)
    }

    fn check_caller(&self, caller: &str, now: Instant) -> bool {
        let mut callers = self.callers.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = self.config.caller_idle;
        let entry = callers
            .entry(caller.to_string())
            .or_insert_with(|| CallerBucket {
                bucket: TokenBucket::new(self.config.caller_burst, self.config.caller_rate, now),
                last_seen: now,
            });

        // An idle bucket counts as forgotten; start over with a full one.
        if now.saturating_duration_since(entry.last_seen) >= idle {
            entry.bucket = TokenBucket::new(self.config.caller_burst, self.config.caller_rate, now);
        }
        entry.last_seen = now;
        entry.bucket.try_acquire(now)
    }

    /// Forget caller buckets that have been idle longer than the idle TTL.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let idle = self.config.caller_idle;
        let mut callers = self.callers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = callers.len();
        callers.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < idle);
        before - callers.len()
    }

    #[must_use]
    pub fn tracked_callers(&self) -> usize {
        self.callers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl RateLimiter for TieredRateLimiter {
    fn check(&self, caller: Option<&str>) -> RateLimitDecision {
        let now = self.clock.now();
        if !self.check_global(now) {
            trace!("global rate limit exceeded");
            return RateLimitDecision::Limited;
        }
        match caller {
            Some(caller) if !self.check_caller(caller, now) => {
                trace!("caller rate limit exceeded");
                RateLimitDecision::Limited
            }
            _ => RateLimitDecision::Allowed,
        }
    }
}

/// Periodically drop idle caller buckets.
pub fn spawn_idle_sweeper(limiter: Arc<TieredRateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = limiter.purge_idle();
            if purged > 0 {
                debug!(purged, "dropped idle caller rate limit buckets");
            }
        }
    })
}
