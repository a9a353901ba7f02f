//! OAuth login: registers callers and hands out the session token they
//! present in the `Authorization` header.

pub mod github;

pub use github::GitHubProvider;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{future::Future, pin::Pin};
use tracing::{debug, info};
use url::Url;
use utoipa::ToSchema;

use crate::backend::{IdentityBackend, UserRecord};
use crate::verify::random_uuid;

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Account details returned by the provider after a successful exchange.
#[derive(Debug, Clone)]
pub struct ProviderUser {
    pub node_id: String,
    pub login: String,
    pub email: String,
    pub access_token: SecretString,
}

pub trait OAuthProvider: Send + Sync {
    /// Where to send the browser to start the login.
    fn authorize_url(&self, redirect_uri: &str) -> Url;

    /// Trade an authorization code for the provider's view of the user.
    fn exchange<'a>(&'a self, code: &'a str) -> ProviderFuture<'a, ProviderUser>;
}

/// Login response body.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoginUser {
    /// Session token for the `Authorization` header.
    pub uuid: String,
    pub name: String,
    pub email: String,
}

/// Return the existing user for this provider account, or register a new one
/// with a fresh session token.
///
/// # Errors
/// Returns an error if the backend lookup fails, or the insert fails and no
/// record for the account exists afterwards.
pub async fn register_or_lookup(
    backend: &dyn IdentityBackend,
    user: ProviderUser,
) -> Result<LoginUser> {
    if let Some(existing) = backend
        .find_user_by_external_id(&user.node_id)
        .await
        .context("failed to lookup user by node id")?
    {
        return Ok(LoginUser {
            uuid: existing.uuid,
            name: existing.name,
            email: existing.email,
        });
    }

    let token = random_uuid().context("failed to generate session token")?;
    let record = UserRecord {
        uuid: token.to_string(),
        name: user.login,
        email: user.email,
        access_token: user.access_token,
        node_id: user.node_id,
    };
    if let Err(err) = backend.insert_user(&record).await {
        // A concurrent first login for the same account may have won the insert.
        if let Some(existing) = backend
            .find_user_by_external_id(&record.node_id)
            .await
            .context("failed to lookup user by node id")?
        {
            debug!("user registered concurrently, using existing record");
            return Ok(LoginUser {
                uuid: existing.uuid,
                name: existing.name,
                email: existing.email,
            });
        }
        return Err(err.context("failed to register user"));
    }
    info!(name = %record.name, "registered new user");

    Ok(LoginUser {
        uuid: record.uuid,
        name: record.name,
        email: record.email,
    })
}
