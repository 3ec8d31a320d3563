use crate::config::{AuthType, ProviderConfig, ProviderType, PASSTHROUGH};
use axum::http::HeaderMap;
use serde_json::Value;
use std::time::Duration;

/// Credential resolved for one attempt. `Passthrough` forwards whatever the
/// client sent; the other variants replace it.
#[derive(Debug, Clone)]
pub enum ResolvedAuth {
    Literal(String),
    OauthToken(String),
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn upstream_path(provider_type: ProviderType) -> &'static str {
    match provider_type {
        ProviderType::Anthropic => "/v1/messages",
        ProviderType::Openai => "/v1/chat/completions",
    }
}

/// Issue the upstream POST. Transport failures become `UpstreamCallError`;
/// any HTTP response, success or not, is handed back for classification.
pub async fn send_request(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    auth: &ResolvedAuth,
    inbound_headers: &HeaderMap,
    body: &Value,
    timeout: Duration,
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = join_url(&provider.base_url, upstream_path(provider.provider_type));
    let mut req = client.post(url).timeout(timeout).json(body);

    req = apply_auth(req, provider, auth, inbound_headers);
    if provider.provider_type == ProviderType::Anthropic {
        req = req.header("anthropic-version", "2023-06-01");
    }

    req.send()
        .await
        .map_err(|err| UpstreamCallError::new(err.to_string()))
}

fn apply_auth(
    mut req: reqwest::RequestBuilder,
    provider: &ProviderConfig,
    auth: &ResolvedAuth,
    inbound_headers: &HeaderMap,
) -> reqwest::RequestBuilder {
    match auth {
        ResolvedAuth::Passthrough => {
            for name in ["authorization", "x-api-key"] {
                if let Some(value) = inbound_headers.get(name) {
                    req = req.header(name, value);
                }
            }
            req
        }
        ResolvedAuth::Literal(value) => match (provider.auth_type, provider.provider_type) {
            (AuthType::ApiKey, ProviderType::Anthropic) => req.header("x-api-key", value),
            _ => req.bearer_auth(value),
        },
        ResolvedAuth::OauthToken(value) => {
            req = req.bearer_auth(value);
            if provider.provider_type == ProviderType::Anthropic {
                // Anthropic rejects OAuth bearer tokens without this beta tag.
                req = req.header("anthropic-beta", "oauth-2025-04-20");
            }
            req
        }
    }
}

pub fn is_passthrough(provider: &ProviderConfig) -> bool {
    provider.auth_value == PASSTHROUGH
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

pub fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("type").or_else(|| v.get("code")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_deduplicates_v1() {
        assert_eq!(
            join_url("https://api.example.com", "/v1/messages"),
            "https://api.example.com/v1/messages"
        );
        assert_eq!(
            join_url("https://api.example.com/v1", "/v1/messages"),
            "https://api.example.com/v1/messages"
        );
        assert_eq!(
            join_url("https://api.example.com/v1/", "v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn error_code_read_from_anthropic_and_openai_shapes() {
        assert_eq!(
            extract_error_code(r#"{"type":"error","error":{"type":"overloaded_error","message":"x"}}"#),
            Some("overloaded_error".to_string())
        );
        assert_eq!(
            extract_error_code(r#"{"error":{"code":"insufficient_quota","message":"x"}}"#),
            Some("insufficient_quota".to_string())
        );
        assert_eq!(extract_error_code("not json"), None);
    }
}
