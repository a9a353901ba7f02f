//! Admission middleware for the verify routes.
//!
//! Order: caller identity (authenticated when required), then the global
//! bucket, then the caller's bucket. Both buckets deny with the same
//! `rate limited` envelope.

use axum::{
    extract::{Extension, Request},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, error};

use super::{error_response, extract_client_ip};
use crate::backend::IdentityBackend;
use crate::verify::{RateLimitDecision, RateLimiter, VerifyError};

/// Rate limit key used when auth is off and no client address is known.
pub const ANONYMOUS: &str = "anonymous";

/// Who a verify request is attributed to; inserted as a request extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

pub struct Admission {
    backend: Arc<dyn IdentityBackend>,
    limiter: Arc<dyn RateLimiter>,
    require_auth: bool,
}

impl Admission {
    #[must_use]
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        limiter: Arc<dyn RateLimiter>,
        require_auth: bool,
    ) -> Self {
        Self {
            backend,
            limiter,
            require_auth,
        }
    }

    #[must_use]
    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    /// With auth off the `Authorization` header is unverified and ignored;
    /// callers are keyed by client address.
    async fn identify(&self, headers: &HeaderMap) -> Result<CallerIdentity, VerifyError> {
        if !self.require_auth {
            let key = extract_client_ip(headers).unwrap_or_else(|| ANONYMOUS.to_string());
            return Ok(CallerIdentity(key));
        }

        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(VerifyError::Unauthorized)?;
        match self.backend.find_user_by_session_token(token).await {
            Ok(Some(user)) => Ok(CallerIdentity(user.uuid)),
            Ok(None) => {
                debug!("unknown session token");
                Err(VerifyError::Unauthorized)
            }
            Err(err) => {
                error!("failed to lookup session token: {err:#}");
                Err(VerifyError::Server)
            }
        }
    }
}

/// Full admission for `/verify/*`.
pub async fn admission(
    Extension(admission): Extension<Arc<Admission>>,
    mut request: Request,
    next: Next,
) -> Response {
    let caller = match admission.identify(request.headers()).await {
        Ok(caller) => caller,
        Err(err) => return error_response(err),
    };

    if admission.limiter.check(Some(&caller.0)) == RateLimitDecision::Limited {
        return error_response(VerifyError::RateLimited);
    }

    request.extensions_mut().insert(caller);
    next.run(request).await
}

/// Global tier only, for routes whose callers are not authenticated yet.
pub async fn global_admission(
    Extension(admission): Extension<Arc<Admission>>,
    request: Request,
    next: Next,
) -> Response {
    if admission.limiter.check(None) == RateLimitDecision::Limited {
        return error_response(VerifyError::RateLimited);
    }
    next.run(request).await
}
