//! Correlation core: the verification store, the correlator state machine and
//! the admission rate limiter.

pub mod clock;
pub mod code;
mod correlator;
mod error;
mod model;
pub mod rate_limit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use code::Code;
pub use correlator::{
    random_uuid, Challenge, CodeSource, Correlator, CorrelatorConfig, MatchOutcome,
};
pub use error::{SUCCESS_CODE, VerifyError};
pub use model::{CodeSlot, Identity, Session};
pub use rate_limit::{
    NoopRateLimiter, RateLimitConfig, RateLimitDecision, RateLimiter, TieredRateLimiter,
};
pub use store::{MemoryStore, VerificationStore};
