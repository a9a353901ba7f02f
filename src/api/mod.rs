#![allow(clippy::needless_for_each)]

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    middleware,
    routing::{get, post},
    Extension, Router,
};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, warn, Span};
use ulid::Ulid;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    backend::{IdentityBackend, MemoryBackend, PgBackend},
    chat::{self, ChatMessage},
    oauth::{GitHubProvider, LoginUser, OAuthProvider},
    verify::{
        rate_limit::spawn_idle_sweeper, store::spawn_reaper, Clock, Correlator,
        CorrelatorConfig, Identity, MemoryStore, RateLimitConfig, RateLimiter, SystemClock,
        TieredRateLimiter,
    },
};

pub mod handlers;

use handlers::{
    chat::{Accepted, ChatEvents, IngestState},
    login::{LoginResponse, LoginState},
    verify::{
        NewVerifyData, NewVerifyResponse, QueryVerifyData, QueryVerifyRequest,
        QueryVerifyResponse,
    },
    Admission, ErrorData, ErrorResponse,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::verify::new_verify,
        handlers::verify::query_verify,
        handlers::login::login,
        handlers::login::login_redirect,
        handlers::chat::chat_events,
    ),
    components(
        schemas(
            handlers::health::Health,
            NewVerifyResponse,
            NewVerifyData,
            QueryVerifyRequest,
            QueryVerifyResponse,
            QueryVerifyData,
            ErrorResponse,
            ErrorData,
            LoginResponse,
            LoginUser,
            ChatEvents,
            ChatMessage,
            Identity,
            Accepted,
        )
    ),
    tags(
        (name = "verify", description = "Chat ownership verification"),
        (name = "login", description = "OAuth login"),
        (name = "chat", description = "Chat event ingestion"),
        (name = "health", description = "Service health"),
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Shared handles the router serves from.
pub struct AppState {
    correlator: Arc<Correlator>,
    admission: Arc<Admission>,
    backend: Arc<dyn IdentityBackend>,
    login: Option<Arc<LoginState>>,
    ingest: Option<Arc<IngestState>>,
}

impl AppState {
    #[must_use]
    pub fn new(
        correlator: Arc<Correlator>,
        backend: Arc<dyn IdentityBackend>,
        limiter: Arc<dyn RateLimiter>,
        require_auth: bool,
    ) -> Self {
        Self {
            correlator,
            admission: Arc::new(Admission::new(backend.clone(), limiter, require_auth)),
            backend,
            login: None,
            ingest: None,
        }
    }

    /// Mount `/login` and `/login/redirect`.
    #[must_use]
    pub fn with_login(mut self, provider: Arc<dyn OAuthProvider>, base_url: &str) -> Self {
        self.login = Some(Arc::new(LoginState::new(
            provider,
            self.backend.clone(),
            base_url,
        )));
        self
    }

    /// Mount `POST /chat/events` guarded by `token`.
    #[must_use]
    pub fn with_ingest(mut self, token: SecretString, tx: mpsc::Sender<ChatMessage>) -> Self {
        self.ingest = Some(Arc::new(IngestState::new(token, tx)));
        self
    }
}

/// Build the application router without the HTTP plumbing layers.
pub fn router(state: AppState) -> Router {
    let verify_routes = Router::new()
        .route("/verify/new_verify", post(handlers::verify::new_verify))
        .route("/verify/query_verify", post(handlers::verify::query_verify))
        .route_layer(middleware::from_fn(handlers::admission));

    let mut app = Router::new()
        .merge(verify_routes)
        .route(
            "/health",
            get(handlers::health::health).options(handlers::health::health),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()));

    if let Some(login) = state.login {
        let login_routes = Router::new()
            .route("/login", get(handlers::login::login))
            .route("/login/redirect", get(handlers::login::login_redirect))
            .route_layer(middleware::from_fn(handlers::global_admission))
            .layer(Extension(login));
        app = app.merge(login_routes);
    }

    if let Some(ingest) = state.ingest {
        app = app.merge(
            Router::new()
                .route("/chat/events", post(handlers::chat::chat_events))
                .layer(Extension(ingest)),
        );
    }

    app.layer(Extension(state.correlator))
        .layer(Extension(state.admission))
        .layer(Extension(state.backend))
}

/// Server settings, assembled by the CLI.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    port: u16,
    room_id: u64,
    dsn: Option<String>,
    base_url: String,
    require_auth: bool,
    github: Option<(String, SecretString)>,
    ingest_token: Option<SecretString>,
    code_ttl: Duration,
    reaper_interval: Duration,
    rate_limit: RateLimitConfig,
}

impl ServerConfig {
    #[must_use]
    pub fn new(port: u16, room_id: u64) -> Self {
        Self {
            port,
            room_id,
            dsn: None,
            base_url: "http://localhost:8080".to_string(),
            require_auth: false,
            github: None,
            ingest_token: None,
            code_ttl: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(600),
            rate_limit: RateLimitConfig::new(),
        }
    }

    #[must_use]
    pub fn with_dsn(mut self, dsn: Option<String>) -> Self {
        self.dsn = dsn;
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    #[must_use]
    pub fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    #[must_use]
    pub fn with_github(mut self, client_id: String, client_secret: SecretString) -> Self {
        self.github = Some((client_id, client_secret));
        self
    }

    #[must_use]
    pub fn with_ingest_token(mut self, token: Option<SecretString>) -> Self {
        self.ingest_token = token;
        self
    }

    #[must_use]
    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.code_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(config: ServerConfig) -> Result<()> {
    let backend: Arc<dyn IdentityBackend> = match &config.dsn {
        Some(dsn) => Arc::new(PgBackend::connect(dsn).await?),
        None => {
            warn!("No DSN configured, users and audit rows are kept in memory");
            Arc::new(MemoryBackend::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let correlator = Arc::new(Correlator::new(
        store.clone(),
        backend.clone(),
        CorrelatorConfig::new(config.room_id).with_ttl(config.code_ttl),
    ));

    let caller_idle = config.rate_limit.caller_idle();
    let limiter = Arc::new(TieredRateLimiter::new(config.rate_limit.clone(), clock));

    spawn_reaper(store, config.reaper_interval);
    spawn_idle_sweeper(limiter.clone(), caller_idle);

    let (tx, rx) = mpsc::channel(chat::CHANNEL_CAPACITY);
    chat::spawn_ingestor(rx, correlator.clone());

    let mut state = AppState::new(correlator, backend, limiter, config.require_auth);

    if config.require_auth {
        let (client_id, client_secret) = config
            .github
            .clone()
            .context("--require-auth needs GitHub client credentials")?;
        let provider = GitHubProvider::new(client_id, client_secret)?;
        state = state.with_login(Arc::new(provider), &config.base_url);
    }

    match config.ingest_token.clone() {
        Some(token) => state = state.with_ingest(token, tx),
        None => info!("No ingest token configured, /chat/events is disabled"),
    }

    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        // allow `GET` and `POST` when accessing the resource
        .allow_methods([Method::GET, Method::POST])
        // allow requests from any origin
        .allow_origin(Any);

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors),
    );

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::{ProviderFuture, ProviderUser};
    use crate::verify::{ManualClock, NoopRateLimiter};
    use anyhow::Result;
    use axum::{
        body::to_bytes,
        http::{header::LOCATION, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;
    use url::Url;

    struct FakeProvider;

    impl OAuthProvider for FakeProvider {
        fn authorize_url(&self, redirect_uri: &str) -> Url {
            Url::parse_with_params(
                "https://idp.example/authorize",
                &[("redirect_uri", redirect_uri)],
            )
            .expect("static url parses")
        }

        fn exchange<'a>(&'a self, code: &'a str) -> ProviderFuture<'a, ProviderUser> {
            Box::pin(async move {
                if code != "good" {
                    return Err(anyhow::anyhow!("bad code"));
                }
                Ok(ProviderUser {
                    node_id: "node-1".to_string(),
                    login: "octocat".to_string(),
                    email: "octocat@example.com".to_string(),
                    access_token: SecretString::from("token".to_string()),
                })
            })
        }
    }

    fn state(require_auth: bool, limiter: Arc<dyn RateLimiter>) -> (AppState, Arc<MemoryBackend>) {
        let clock = ManualClock::new();
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(MemoryStore::new(Arc::new(clock)));
        let correlator = Arc::new(Correlator::new(
            store,
            backend.clone(),
            CorrelatorConfig::new(1),
        ));
        (
            AppState::new(correlator, backend.clone(), limiter, require_auth),
            backend,
        )
    }

    async fn json_body(response: axum::response::Response) -> Result<Value> {
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    #[test]
    fn openapi_lists_routes() {
        let doc = openapi();
        for path in [
            "/health",
            "/verify/new_verify",
            "/verify/query_verify",
            "/login",
            "/login/redirect",
            "/chat/events",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[tokio::test]
    async fn health_reports_backend_and_x_app() -> Result<()> {
        let (state, _backend) = state(false, Arc::new(NoopRateLimiter));
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("X-App"));
        let body = json_body(response).await?;
        assert_eq!(body["backend"], "ok");
        assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
        Ok(())
    }

    #[tokio::test]
    async fn health_options_has_empty_body() -> Result<()> {
        let (state, _backend) = state(false, Arc::new(NoopRateLimiter));
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/health")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert!(body.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn require_auth_rejects_missing_header() -> Result<()> {
        let (state, _backend) = state(true, Arc::new(NoopRateLimiter));
        let response = router(state)
            .oneshot(Request::post("/verify/new_verify").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await?["code"], 5);
        Ok(())
    }

    #[tokio::test]
    async fn caller_tier_ignores_unverified_header() -> Result<()> {
        let limiter = Arc::new(TieredRateLimiter::new(
            RateLimitConfig::new().with_caller(0.001, 1),
            Arc::new(ManualClock::new()),
        ));
        let (state, _backend) = state(false, limiter);
        let app = router(state);

        let first = app
            .clone()
            .oneshot(
                Request::post("/verify/new_verify")
                    .header(AUTHORIZATION, "alice")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(json_body(first).await?["code"], 0);

        // A fresh header value does not buy a fresh bucket.
        let rotated = app
            .clone()
            .oneshot(
                Request::post("/verify/new_verify")
                    .header(AUTHORIZATION, "bob")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(rotated.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(rotated).await?["code"], 6);

        let other_client = app
            .oneshot(
                Request::post("/verify/new_verify")
                    .header("x-forwarded-for", "198.51.100.4")
                    .header(AUTHORIZATION, "bob")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(json_body(other_client).await?["code"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn login_redirects_and_registers() -> Result<()> {
        let (state, backend) = state(true, Arc::new(NoopRateLimiter));
        let app = router(state.with_login(Arc::new(FakeProvider), "https://verify.example/"));

        let response = app
            .clone()
            .oneshot(Request::get("/login").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(location.starts_with("https://idp.example/authorize"));
        assert!(location.contains("verify.example%2Flogin%2Fredirect"));

        let response = app
            .clone()
            .oneshot(Request::get("/login/redirect?code=good").body(Body::empty())?)
            .await?;
        let body = json_body(response).await?;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["name"], "octocat");
        let token = body["data"]["uuid"].as_str().unwrap_or_default().to_string();
        assert!(backend.find_user_by_session_token(&token).await?.is_some());

        let response = app
            .oneshot(
                Request::post("/verify/new_verify")
                    .header(AUTHORIZATION, token.as_str())
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(json_body(response).await?["code"], 0);
        assert_eq!(backend.audit_rows()[0].caller, token);
        Ok(())
    }

    #[tokio::test]
    async fn login_redirect_with_bad_code_is_server_error() -> Result<()> {
        let (state, _backend) = state(true, Arc::new(NoopRateLimiter));
        let app = router(state.with_login(Arc::new(FakeProvider), "https://verify.example"));
        let response = app
            .oneshot(Request::get("/login/redirect?code=bad").body(Body::empty())?)
            .await?;
        assert_eq!(json_body(response).await?["code"], 4);
        Ok(())
    }

    #[tokio::test]
    async fn login_routes_absent_without_provider() -> Result<()> {
        let (state, _backend) = state(false, Arc::new(NoopRateLimiter));
        let response = router(state)
            .oneshot(Request::get("/login").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }
}
