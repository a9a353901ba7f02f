use axum::{
    extract::{Extension, Query},
    http::{header::LOCATION, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, instrument};
use utoipa::{IntoParams, ToSchema};

use super::error_response;
use crate::backend::IdentityBackend;
use crate::oauth::{register_or_lookup, LoginUser, OAuthProvider};
use crate::verify::{VerifyError, SUCCESS_CODE};

pub struct LoginState {
    provider: Arc<dyn OAuthProvider>,
    backend: Arc<dyn IdentityBackend>,
    redirect_uri: String,
}

impl LoginState {
    /// `base_url` is the public address of this service.
    #[must_use]
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        backend: Arc<dyn IdentityBackend>,
        base_url: &str,
    ) -> Self {
        Self {
            provider,
            backend,
            redirect_uri: format!("{}/login/redirect", base_url.trim_end_matches('/')),
        }
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }
}

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct RedirectParams {
    /// Authorization code issued by the provider.
    code: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub code: u8,
    pub data: LoginUser,
}

#[utoipa::path(
    get,
    path= "/login",
    responses (
        (status = 302, description = "Redirect to the OAuth provider"),
    ),
    tag= "login"
)]
pub async fn login(Extension(state): Extension<Arc<LoginState>>) -> Response {
    let url = state.provider.authorize_url(&state.redirect_uri);
    (StatusCode::FOUND, [(LOCATION, url.to_string())]).into_response()
}

#[utoipa::path(
    get,
    path= "/login/redirect",
    params(RedirectParams),
    responses (
        (status = 200, description = "Session token for the logged in user, or error envelope with code 4/5", body = LoginResponse),
    ),
    tag= "login"
)]
#[instrument(skip_all)]
pub async fn login_redirect(
    Extension(state): Extension<Arc<LoginState>>,
    Query(params): Query<RedirectParams>,
) -> Response {
    let Some(code) = params.code.filter(|code| !code.is_empty()) else {
        return error_response(VerifyError::Unauthorized);
    };

    let user = match state.provider.exchange(&code).await {
        Ok(user) => user,
        Err(err) => {
            error!("OAuth exchange failed: {err:#}");
            return error_response(VerifyError::Server);
        }
    };

    match register_or_lookup(state.backend.as_ref(), user).await {
        Ok(user) => Json(LoginResponse {
            code: SUCCESS_CODE,
            data: user,
        })
        .into_response(),
        Err(err) => {
            error!("Failed to register user: {err:#}");
            error_response(VerifyError::Server)
        }
    }
}
