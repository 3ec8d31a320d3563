use crate::error::{AppError, AppResult};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Sentinel accepted for both `auth_value` and candidate `model`: forward the
/// client's value unchanged.
pub const PASSTHROUGH: &str = "passthrough";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub model_routes: Vec<ModelRoute>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub base_url: String,
    pub auth_type: AuthType,
    pub auth_value: String,
    #[serde(default)]
    pub account_email: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ProviderConfig {
    /// Identity key: `name`, qualified by the account email when present.
    /// Multiple entries may share a name as long as the emails differ.
    pub fn key(&self) -> String {
        match &self.account_email {
            Some(email) => format!("{}:{}", self.name, email),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Anthropic,
    Openai,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Openai => "openai",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    AuthToken,
    Oauth,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRoute {
    /// Exact model name, or a glob where `*` segments match anything and the
    /// literal parts must appear in order (case-insensitive).
    pub model: String,
    pub candidates: Vec<RouteCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteCandidate {
    pub provider: String,
    #[serde(default = "default_candidate_model")]
    pub model: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub account_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub selection_strategy: SelectionStrategy,
    #[serde(default = "default_failure_cooldown")]
    pub failure_cooldown: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_true")]
    pub unhealthy_reset_on_success: bool,
    #[serde(default = "default_unhealthy_reset_timeout")]
    pub unhealthy_reset_timeout: u64,
    #[serde(default)]
    pub streaming_mode: StreamingMode,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_exception_patterns")]
    pub unhealthy_exception_patterns: Vec<String>,
    #[serde(default = "default_body_patterns")]
    pub unhealthy_response_body_patterns: Vec<String>,
    #[serde(default = "default_unhealthy_http_codes")]
    pub unhealthy_http_codes: Vec<u16>,
    #[serde(default)]
    pub deduplication: DeduplicationSettings,
    #[serde(default)]
    pub oauth: OauthSettings,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file_path: Option<String>,
    #[serde(default)]
    pub testing: TestingSettings,
    /// Keys this version no longer recognizes land here; warned about at load.
    #[serde(flatten)]
    pub unknown: HashMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty settings")
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Priority,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    #[default]
    Auto,
    Direct,
    Background,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    #[serde(default = "TimeoutSet::non_streaming")]
    pub non_streaming: TimeoutSet,
    #[serde(default = "TimeoutSet::streaming")]
    pub streaming: TimeoutSet,
    #[serde(default)]
    pub caching: CachingTimeouts,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            non_streaming: TimeoutSet::non_streaming(),
            streaming: TimeoutSet::streaming(),
            caching: CachingTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSet {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout: u64,
}

impl TimeoutSet {
    fn non_streaming() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: 60,
            pool_timeout: default_pool_timeout(),
        }
    }

    fn streaming() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: 120,
            pool_timeout: default_pool_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachingTimeouts {
    #[serde(default = "default_deduplication_timeout")]
    pub deduplication_timeout: u64,
}

impl Default for CachingTimeouts {
    fn default() -> Self {
        Self {
            deduplication_timeout: default_deduplication_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeduplicationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub include_max_tokens_in_signature: bool,
    #[serde(default = "default_sse_error_cleanup_delay")]
    pub sse_error_cleanup_delay: u64,
}

impl Default for DeduplicationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            include_max_tokens_in_signature: false,
            sse_error_cleanup_delay: default_sse_error_cleanup_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OauthSettings {
    #[serde(default = "default_true")]
    pub enable_persistence: bool,
    #[serde(default = "default_true")]
    pub enable_auto_refresh: bool,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub proxy: Option<String>,
    /// Override for the token endpoint; defaults to the Anthropic console.
    #[serde(default)]
    pub token_url: Option<String>,
}

impl Default for OauthSettings {
    fn default() -> Self {
        Self {
            enable_persistence: true,
            enable_auto_refresh: true,
            service_name: default_service_name(),
            proxy: None,
            token_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TestingSettings {
    #[serde(default)]
    pub simulate_delay: bool,
    #[serde(default)]
    pub delay_seconds: u64,
    #[serde(default)]
    pub delay_trigger_keywords: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_candidate_model() -> String {
    PASSTHROUGH.to_string()
}

fn default_priority() -> i32 {
    100
}

fn default_failure_cooldown() -> u64 {
    60
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_unhealthy_reset_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

fn default_pool_timeout() -> u64 {
    5
}

fn default_deduplication_timeout() -> u64 {
    180
}

fn default_sse_error_cleanup_delay() -> u64 {
    3
}

fn default_service_name() -> String {
    "switchboard".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_exception_patterns() -> Vec<String> {
    ["connection", "timeout", "timed out", "ssl", "reset by peer"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_body_patterns() -> Vec<String> {
    [
        r"(?i)insufficient[_ ]quota",
        r"(?i)overloaded",
        r"(?i)rate[_ ]?limit",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_unhealthy_http_codes() -> Vec<u16> {
    vec![402, 408, 429, 500, 502, 503, 504]
}

const RETIRED_SETTINGS_KEYS: &[&str] = &["failover_error_types", "failover_http_codes"];

pub fn load(path: &Path) -> AppResult<Config> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "config_read_failed",
            format!("{}: {err}", path.display()),
        )
    })?;
    let config: Config = serde_yaml::from_str(&raw).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "config_parse_failed",
            err.to_string(),
        )
    })?;
    validate(&config)?;
    Ok(config)
}

/// Called after the subscriber is installed so the warnings are not dropped
/// during startup.
pub fn warn_unrecognized_keys(config: &Config) {
    for key in config.settings.unknown.keys() {
        if RETIRED_SETTINGS_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "settings key is retired; retry behavior now derives from the unhealthy_* classification settings");
        } else {
            tracing::warn!(key = %key, "unrecognized settings key ignored");
        }
    }
}

fn validate(config: &Config) -> AppResult<()> {
    let invalid = |message: String| {
        AppError::new(StatusCode::BAD_REQUEST, "config_invalid", message)
    };
    let mut seen = std::collections::HashSet::new();
    for provider in &config.providers {
        if provider.name.trim().is_empty() {
            return Err(invalid("provider name must not be empty".to_string()));
        }
        if provider.base_url.trim().is_empty() {
            return Err(invalid(format!(
                "provider {} is missing base_url",
                provider.name
            )));
        }
        if !seen.insert(provider.key()) {
            return Err(invalid(format!(
                "duplicate provider identity: {}",
                provider.key()
            )));
        }
        if provider.auth_type == AuthType::Oauth && provider.auth_value == PASSTHROUGH {
            return Err(invalid(format!(
                "provider {}: oauth auth cannot be passthrough",
                provider.name
            )));
        }
    }
    for route in &config.model_routes {
        if route.candidates.is_empty() {
            return Err(invalid(format!(
                "route {} has no candidates",
                route.model
            )));
        }
        for candidate in &route.candidates {
            let found = config
                .providers
                .iter()
                .any(|p| p.name == candidate.provider);
            if !found {
                return Err(invalid(format!(
                    "route {} references unknown provider {}",
                    route.model, candidate.provider
                )));
            }
        }
    }
    for pattern in &config.settings.unhealthy_response_body_patterns {
        regex::Regex::new(pattern).map_err(|err| {
            invalid(format!("bad unhealthy_response_body_patterns entry: {err}"))
        })?;
    }
    Ok(())
}

/// Body-pattern regexes compiled once per loaded snapshot.
pub fn compile_body_patterns(settings: &Settings) -> Vec<regex::Regex> {
    settings
        .unhealthy_response_body_patterns
        .iter()
        .filter_map(|pattern| regex::Regex::new(pattern).ok())
        .collect()
}
