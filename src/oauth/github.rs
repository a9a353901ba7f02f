//! GitHub OAuth app flow.

use anyhow::{anyhow, Context, Result};
use reqwest::{header::ACCEPT, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::{OAuthProvider, ProviderFuture, ProviderUser};
use crate::APP_USER_AGENT;

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const USER_URL: &str = "https://api.github.com/user";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct GitHubUser {
    login: String,
    node_id: String,
    email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GitHubProvider {
    client: Client,
    client_id: String,
    client_secret: SecretString,
    authorize_endpoint: Url,
    token_endpoint: Url,
    user_endpoint: Url,
}

impl GitHubProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(client_id: String, client_secret: SecretString) -> Result<Self> {
        let client = Client::builder().user_agent(APP_USER_AGENT).build()?;
        Ok(Self {
            client,
            client_id,
            client_secret,
            authorize_endpoint: Url::parse(AUTHORIZE_URL)?,
            token_endpoint: Url::parse(TOKEN_URL)?,
            user_endpoint: Url::parse(USER_URL)?,
        })
    }

    /// Point the provider at other endpoints (GitHub Enterprise, tests).
    #[must_use]
    pub fn with_endpoints(mut self, authorize: Url, token: Url, user: Url) -> Self {
        self.authorize_endpoint = authorize;
        self.token_endpoint = token;
        self.user_endpoint = user;
        self
    }

    #[instrument(skip(self, code))]
    async fn access_token(&self, code: &str) -> Result<SecretString> {
        let response = self
            .client
            .post(self.token_endpoint.clone())
            .header(ACCEPT, "application/json")
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("code", code),
            ])
            .send()
            .await
            .context("failed to reach token endpoint")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("token endpoint returned {status}"));
        }

        let body: TokenResponse = response
            .json()
            .await
            .context("failed to parse token response")?;

        match (body.access_token, body.error) {
            (Some(token), None) => Ok(SecretString::from(token)),
            (_, Some(error)) => Err(anyhow!(
                "token exchange rejected: {error} {}",
                body.error_description.unwrap_or_default()
            )),
            (None, None) => Err(anyhow!("token response without access_token")),
        }
    }

    #[instrument(skip(self, token))]
    async fn user(&self, token: &SecretString) -> Result<GitHubUser> {
        let response = self
            .client
            .get(self.user_endpoint.clone())
            .header(ACCEPT, "application/vnd.github+json")
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .context("failed to reach user endpoint")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("user endpoint returned {status}"));
        }

        let user: GitHubUser = response
            .json()
            .await
            .context("failed to parse user profile")?;
        debug!(login = %user.login, "fetched user profile");
        Ok(user)
    }
}

impl OAuthProvider for GitHubProvider {
    fn authorize_url(&self, redirect_uri: &str) -> Url {
        let mut url = self.authorize_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri);
        url
    }

    fn exchange<'a>(&'a self, code: &'a str) -> ProviderFuture<'a, ProviderUser> {
        Box::pin(async move {
            let token = self.access_token(code).await?;
            let user = self.user(&token).await?;
            Ok(ProviderUser {
                node_id: user.node_id,
                login: user.login,
                email: user.email.unwrap_or_default(),
                access_token: token,
            })
        })
    }
}
