use crate::config::OauthSettings;
use crate::error::{AppError, AppResult};
use axum::http::StatusCode;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
const SCOPES: &str = "org:create_api_key user:profile user:inference";

/// Tokens within this margin of expiry are treated as unusable and refreshed.
const EXPIRY_MARGIN_SECS: i64 = 300;
const REFRESH_BACKOFF_SECS: i64 = 3_600;
const PENDING_STATE_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub created_at: i64,
    #[serde(default)]
    pub last_used_at: i64,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub refresh_backoff_until: i64,
}

impl OauthToken {
    pub fn usable(&self, now: i64) -> bool {
        now + EXPIRY_MARGIN_SECS < self.expires_at && now >= self.refresh_backoff_until
    }

    fn needs_refresh(&self, now: i64) -> bool {
        now + EXPIRY_MARGIN_SECS >= self.expires_at
    }
}

#[derive(Debug, Serialize)]
pub struct AccountStatus {
    pub account_email: String,
    pub expires_at: i64,
    pub usable: bool,
    pub last_used_at: i64,
    pub usage_count: u64,
    pub refresh_backoff_until: i64,
}

struct PendingAuthorization {
    code_verifier: String,
    created_at: i64,
}

/// Per-account OAuth token lifecycle: issuance via the PKCE flow, automatic
/// refresh with per-account singleflight, optional OS-keyring persistence,
/// and round-robin selection for candidates that do not pin an account.
#[derive(Clone)]
pub struct OauthStore {
    tokens: Arc<tokio::sync::Mutex<HashMap<String, OauthToken>>>,
    refresh_locks: Arc<tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    pending: Arc<Mutex<HashMap<String, PendingAuthorization>>>,
}

impl Default for OauthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OauthStore {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            refresh_locks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Warm the in-process cache from the keyring for every configured
    /// oauth account. Missing or unreadable entries are skipped.
    pub async fn load_persisted_accounts(&self, settings: &OauthSettings, accounts: &[String]) {
        if !settings.enable_persistence {
            return;
        }
        for account in accounts {
            match read_keyring(&settings.service_name, account).await {
                Some(token) => {
                    tracing::info!(account = %account, "loaded persisted OAuth token");
                    self.tokens.lock().await.insert(account.clone(), token);
                }
                None => {
                    tracing::debug!(account = %account, "no persisted OAuth token");
                }
            }
        }
    }

    /// Resolve an access token for a candidate. `account_email` pins the
    /// account; without it, usable tokens are rotated by least-recent use.
    pub async fn access_token(
        &self,
        settings: &OauthSettings,
        account_email: Option<&str>,
        now: i64,
    ) -> AppResult<String> {
        let account = match account_email {
            Some(email) => email.to_string(),
            None => self.pick_account(now).await.ok_or_else(|| {
                self.emit_operator_instructions("any");
                AppError::auth_required("any")
            })?,
        };

        let token = { self.tokens.lock().await.get(&account).cloned() };
        let token = match token {
            Some(token) => token,
            None => {
                self.emit_operator_instructions(&account);
                return Err(AppError::auth_required(&account));
            }
        };

        let token = if token.needs_refresh(now) {
            if settings.enable_auto_refresh && now >= token.refresh_backoff_until {
                match self.refresh_singleflight(settings, &account, now).await {
                    Ok(refreshed) => refreshed,
                    Err(err) => {
                        // The pre-refresh token may still be inside its
                        // validity window; only then is it returned.
                        if now < token.expires_at {
                            token
                        } else {
                            self.emit_operator_instructions(&account);
                            return Err(err);
                        }
                    }
                }
            } else if now < token.expires_at {
                token
            } else {
                self.emit_operator_instructions(&account);
                return Err(AppError::auth_required(&account));
            }
        } else {
            token
        };

        let mut guard = self.tokens.lock().await;
        if let Some(entry) = guard.get_mut(&account) {
            entry.last_used_at = now;
            entry.usage_count = entry.usage_count.saturating_add(1);
        }
        Ok(token.access_token)
    }

    async fn pick_account(&self, now: i64) -> Option<String> {
        let guard = self.tokens.lock().await;
        guard
            .iter()
            .filter(|(_, token)| token.usable(now))
            .min_by_key(|(_, token)| token.last_used_at)
            .map(|(account, _)| account.clone())
    }

    /// Refresh with per-account coalescing: concurrent callers block on one
    /// refresh and share its result.
    async fn refresh_singleflight(
        &self,
        settings: &OauthSettings,
        account: &str,
        now: i64,
    ) -> AppResult<OauthToken> {
        let lock = {
            let mut guard = self.refresh_locks.lock().await;
            guard
                .entry(account.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _held = lock.lock().await;

        // A concurrent caller may have completed the refresh while this one
        // waited on the lock.
        if let Some(token) = self.tokens.lock().await.get(account) {
            if token.usable(now) {
                return Ok(token.clone());
            }
        }
        self.refresh(settings, account, now).await
    }

    /// Perform one refresh HTTP call and swap the stored token atomically.
    pub async fn refresh(
        &self,
        settings: &OauthSettings,
        account: &str,
        now: i64,
    ) -> AppResult<OauthToken> {
        let refresh_token = {
            let guard = self.tokens.lock().await;
            match guard.get(account) {
                Some(token) => token.refresh_token.clone(),
                None => {
                    return Err(AppError::auth_required(account));
                }
            }
        };

        let client = oauth_http_client(settings)?;
        let result = client
            .post(token_url(settings))
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": CLIENT_ID,
            }))
            .send()
            .await;

        let response = match result {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                self.record_refresh_failure(account, now).await;
                tracing::warn!(account = %account, %status, "OAuth refresh rejected: {body}");
                return Err(AppError::new(
                    StatusCode::UNAUTHORIZED,
                    "oauth_refresh_failed",
                    format!("refresh rejected with status {status}"),
                ));
            }
            Err(err) => {
                self.record_refresh_failure(account, now).await;
                tracing::warn!(account = %account, "OAuth refresh transport error: {err}");
                return Err(AppError::new(
                    StatusCode::UNAUTHORIZED,
                    "oauth_refresh_failed",
                    err.to_string(),
                ));
            }
        };

        let payload: TokenEndpointResponse = response.json().await.map_err(|err| {
            AppError::new(
                StatusCode::UNAUTHORIZED,
                "oauth_refresh_failed",
                format!("malformed token response: {err}"),
            )
        })?;

        let token = {
            let mut guard = self.tokens.lock().await;
            let previous = guard.get(account);
            let token = payload.into_token(now, previous);
            guard.insert(account.to_string(), token.clone());
            token
        };
        tracing::info!(account = %account, expires_at = token.expires_at, "OAuth token refreshed");
        self.persist(settings, account, &token).await;
        Ok(token)
    }

    async fn record_refresh_failure(&self, account: &str, now: i64) {
        let mut guard = self.tokens.lock().await;
        if let Some(token) = guard.get_mut(account) {
            token.refresh_backoff_until = now + REFRESH_BACKOFF_SECS;
        }
    }

    /// Begin an authorization-code + PKCE flow. Returns the browser URL and
    /// the opaque state the callback must echo.
    pub fn generate_authorize_url(&self, now: i64) -> (String, String) {
        let state = Uuid::new_v4().to_string();
        let code_verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(Uuid::new_v4().as_bytes())
            + &base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(Uuid::new_v4().as_bytes());
        let digest = Sha256::digest(code_verifier.as_bytes());
        let code_challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);

        {
            let mut guard = self.pending.lock().expect("pending oauth lock");
            guard.retain(|_, entry| now - entry.created_at <= PENDING_STATE_TTL_SECS);
            guard.insert(
                state.clone(),
                PendingAuthorization {
                    code_verifier,
                    created_at: now,
                },
            );
        }

        let params = [
            ("code", "true"),
            ("client_id", CLIENT_ID),
            ("response_type", "code"),
            ("redirect_uri", REDIRECT_URI),
            ("scope", SCOPES),
            ("code_challenge", code_challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", state.as_str()),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        (format!("{AUTHORIZE_URL}?{query}"), state)
    }

    /// Exchange an authorization code for tokens and store them under the
    /// given account. Accepts the `code#state` form the callback page shows.
    pub async fn exchange_code(
        &self,
        settings: &OauthSettings,
        code: &str,
        account_email: &str,
        now: i64,
    ) -> AppResult<OauthToken> {
        let (code, state_hint) = match code.split_once('#') {
            Some((code, state)) => (code.to_string(), Some(state.to_string())),
            None => (code.to_string(), None),
        };

        let (state, verifier) = {
            let mut guard = self.pending.lock().expect("pending oauth lock");
            guard.retain(|_, entry| now - entry.created_at <= PENDING_STATE_TTL_SECS);
            let state = match state_hint {
                Some(state) if guard.contains_key(&state) => state,
                Some(_) | None => {
                    if guard.len() == 1 {
                        guard.keys().next().cloned().ok_or_else(|| {
                            AppError::new(
                                StatusCode::BAD_REQUEST,
                                "oauth_state_missing",
                                "no pending authorization",
                            )
                        })?
                    } else {
                        return Err(AppError::new(
                            StatusCode::BAD_REQUEST,
                            "oauth_state_missing",
                            "no matching pending authorization; call /oauth/generate-url first",
                        ));
                    }
                }
            };
            let entry = guard.remove(&state).ok_or_else(|| {
                AppError::new(
                    StatusCode::BAD_REQUEST,
                    "oauth_state_missing",
                    "authorization state expired",
                )
            })?;
            (state, entry.code_verifier)
        };

        let client = oauth_http_client(settings)?;
        let response = client
            .post(token_url(settings))
            .json(&json!({
                "grant_type": "authorization_code",
                "code": code,
                "state": state,
                "client_id": CLIENT_ID,
                "redirect_uri": REDIRECT_URI,
                "code_verifier": verifier,
            }))
            .send()
            .await
            .map_err(|err| {
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "oauth_exchange_failed",
                    err.to_string(),
                )
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::new(
                StatusCode::BAD_REQUEST,
                "oauth_exchange_failed",
                format!("token endpoint returned {status}: {body}"),
            ));
        }
        let payload: TokenEndpointResponse = response.json().await.map_err(|err| {
            AppError::new(
                StatusCode::BAD_GATEWAY,
                "oauth_exchange_failed",
                format!("malformed token response: {err}"),
            )
        })?;

        let token = payload.into_token(now, None);
        self.tokens
            .lock()
            .await
            .insert(account_email.to_string(), token.clone());
        tracing::info!(account = %account_email, "OAuth token stored");
        self.persist(settings, account_email, &token).await;
        Ok(token)
    }

    pub async fn status(&self, now: i64) -> Vec<AccountStatus> {
        let guard = self.tokens.lock().await;
        let mut entries: Vec<AccountStatus> = guard
            .iter()
            .map(|(account, token)| AccountStatus {
                account_email: account.clone(),
                expires_at: token.expires_at,
                usable: token.usable(now),
                last_used_at: token.last_used_at,
                usage_count: token.usage_count,
                refresh_backoff_until: token.refresh_backoff_until,
            })
            .collect();
        entries.sort_by(|a, b| a.account_email.cmp(&b.account_email));
        entries
    }

    /// Remove one account's token, or every token when `account` is None.
    pub async fn remove(&self, settings: &OauthSettings, account: Option<&str>) -> usize {
        let removed: Vec<String> = {
            let mut guard = self.tokens.lock().await;
            match account {
                Some(account) => guard.remove(account).map(|_| vec![account.to_string()]).unwrap_or_default(),
                None => guard.drain().map(|(account, _)| account).collect(),
            }
        };
        if settings.enable_persistence {
            for account in &removed {
                delete_keyring(&settings.service_name, account).await;
            }
        }
        removed.len()
    }

    pub async fn insert_token(&self, account: &str, token: OauthToken) {
        self.tokens.lock().await.insert(account.to_string(), token);
    }

    async fn persist(&self, settings: &OauthSettings, account: &str, token: &OauthToken) {
        if !settings.enable_persistence {
            return;
        }
        write_keyring(&settings.service_name, account, token).await;
    }

    fn emit_operator_instructions(&self, account: &str) {
        tracing::warn!(
            account = %account,
            "OAuth authorization required: open GET /oauth/generate-url in a browser, \
             sign in with the named account, then POST the resulting code to /oauth/exchange-code"
        );
    }
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenEndpointResponse {
    fn into_token(self, now: i64, previous: Option<&OauthToken>) -> OauthToken {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous.map(|t| t.refresh_token.clone()))
            .unwrap_or_default();
        OauthToken {
            access_token: self.access_token,
            refresh_token,
            expires_at: now + self.expires_in.unwrap_or(3_600),
            scopes: self
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            created_at: previous.map(|t| t.created_at).unwrap_or(now),
            last_used_at: previous.map(|t| t.last_used_at).unwrap_or(0),
            usage_count: previous.map(|t| t.usage_count).unwrap_or(0),
            refresh_backoff_until: 0,
        }
    }
}

fn token_url(settings: &OauthSettings) -> String {
    settings
        .token_url
        .clone()
        .unwrap_or_else(|| TOKEN_URL.to_string())
}

fn oauth_http_client(settings: &OauthSettings) -> AppResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent("switchboard/0.1");
    if let Some(proxy) = &settings.proxy {
        let proxy = reqwest::Proxy::all(proxy).map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "oauth_proxy_invalid",
                err.to_string(),
            )
        })?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "http_client_init_failed",
            err.to_string(),
        )
    })
}

async fn read_keyring(service: &str, account: &str) -> Option<OauthToken> {
    let service = service.to_string();
    let account = account.to_string();
    tokio::task::spawn_blocking(move || {
        let entry = keyring::Entry::new(&service, &account).ok()?;
        let raw = entry.get_password().ok()?;
        serde_json::from_str(&raw).ok()
    })
    .await
    .ok()
    .flatten()
}

async fn write_keyring(service: &str, account: &str, token: &OauthToken) {
    let service = service.to_string();
    let owner = account.to_string();
    let Ok(raw) = serde_json::to_string(token) else {
        return;
    };
    let task_owner = owner.clone();
    let result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(&service, &task_owner)
            .and_then(|entry| entry.set_password(&raw))
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(account = %owner, "keyring write failed: {err}"),
        Err(err) => tracing::warn!(account = %owner, "keyring write task failed: {err}"),
    }
}

async fn delete_keyring(service: &str, account: &str) {
    let service = service.to_string();
    let account = account.to_string();
    let _ = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(&service, &account)
            .and_then(|entry| entry.delete_credential())
    })
    .await;
}
