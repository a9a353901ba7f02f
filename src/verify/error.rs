//! Error taxonomy shared by the correlator and the HTTP layer.

/// Code returned alongside successful responses.
pub const SUCCESS_CODE: u8 = 0;

/// Every failure a caller can observe. Each variant carries a stable numeric
/// code and a short message; nothing else crosses the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// The code exists but no chat message has claimed it yet (poll again),
    /// or it expired unclaimed.
    #[error("verify code not used")]
    NotUsed,
    #[error("verify code not found")]
    NotFound,
    #[error("verify code is empty")]
    EmptyQuery,
    /// A backend dependency failed.
    #[error("server error")]
    Server,
    #[error("authorization error")]
    Unauthorized,
    /// Admission denied by either rate limit tier.
    #[error("rate limited")]
    RateLimited,
}

impl VerifyError {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::NotUsed => 1,
            Self::NotFound => 2,
            Self::EmptyQuery => 3,
            Self::Server => 4,
            Self::Unauthorized => 5,
            Self::RateLimited => 6,
        }
    }
}
