use crate::config::{self, Config, ProviderConfig};
use crate::dedup::DedupTable;
use crate::error::{AppError, AppResult};
use crate::health::HealthTracker;
use crate::oauth::OauthStore;
use crate::providers;
use crate::routing::RouteCursors;
use arc_swap::ArcSwap;
use axum::routing::{delete, get, post};
use axum::Router;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Immutable view of one loaded configuration. Requests take the `Arc` at
/// entry and keep it for their whole lifetime; reloads swap in a new one
/// without touching the old.
pub struct Snapshot {
    pub config: Config,
    pub body_patterns: Vec<Regex>,
}

impl Snapshot {
    pub fn new(config: Config) -> Self {
        let body_patterns = config::compile_body_patterns(&config.settings);
        Self {
            config,
            body_patterns,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub snapshot: Arc<ArcSwap<Snapshot>>,
    pub config_path: Arc<PathBuf>,
    pub http: reqwest::Client,
    pub health: HealthTracker,
    pub dedup: DedupTable,
    pub oauth: OauthStore,
    pub route_cursors: RouteCursors,
    proxy_clients: Arc<tokio::sync::Mutex<HashMap<String, reqwest::Client>>>,
}

impl AppState {
    /// The shared client, or a cached per-provider client when the provider
    /// routes its traffic through an outbound proxy.
    pub async fn client_for(&self, provider: &ProviderConfig) -> AppResult<reqwest::Client> {
        let Some(proxy_url) = &provider.proxy else {
            return Ok(self.http.clone());
        };
        let mut guard = self.proxy_clients.lock().await;
        if let Some(client) = guard.get(proxy_url) {
            return Ok(client.clone());
        }
        let snapshot = self.snapshot.load();
        let client = build_http_client(&snapshot.config, Some(proxy_url))?;
        guard.insert(proxy_url.clone(), client.clone());
        Ok(client)
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub async fn load_state(config_path: PathBuf) -> AppResult<AppState> {
    let config = config::load(&config_path)?;
    load_state_with_config(config_path, config).await
}

pub async fn load_state_with_config(config_path: PathBuf, config: Config) -> AppResult<AppState> {
    let http = build_http_client(&config, None)?;

    let oauth = OauthStore::new();
    oauth
        .load_persisted_accounts(&config.settings.oauth, &providers::oauth_accounts(&config))
        .await;

    Ok(AppState {
        snapshot: Arc::new(ArcSwap::from_pointee(Snapshot::new(config))),
        config_path: Arc::new(config_path),
        http,
        health: HealthTracker::new(),
        dedup: DedupTable::new(),
        oauth,
        route_cursors: RouteCursors::new(),
        proxy_clients: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
    })
}

fn build_http_client(config: &Config, proxy: Option<&str>) -> AppResult<reqwest::Client> {
    let timeouts = &config.settings.timeouts.non_streaming;
    let mut builder = reqwest::Client::builder()
        .user_agent("switchboard/0.1")
        .connect_timeout(Duration::from_secs(timeouts.connect_timeout))
        .pool_idle_timeout(Duration::from_secs(timeouts.pool_timeout));
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy).map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "proxy_invalid",
                err.to_string(),
            )
        })?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "http_client_init_failed",
            err.to_string(),
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/v1/messages", post(crate::handlers::create_messages))
        .route("/v1/models", get(crate::handlers::list_models))
        .route("/providers", get(crate::handlers::list_providers))
        .route("/health", get(crate::handlers::health_check))
        .route("/config/reload", post(crate::handlers::reload_config))
        .route(
            "/oauth/generate-url",
            get(crate::handlers::oauth_generate_url),
        )
        .route(
            "/oauth/exchange-code",
            post(crate::handlers::oauth_exchange_code),
        )
        .route(
            "/oauth/refresh/{account_email}",
            post(crate::handlers::oauth_refresh),
        )
        .route("/oauth/status", get(crate::handlers::oauth_status))
        .route("/oauth/tokens", delete(crate::handlers::oauth_delete_all))
        .route(
            "/oauth/tokens/{account_email}",
            delete(crate::handlers::oauth_delete_one),
        )
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
