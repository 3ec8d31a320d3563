use switchboard::config::{Config, ProviderType, SelectionStrategy};

#[test]
fn full_config_parses_with_defaults() {
    let yaml = r#"
providers:
  - name: anthropic-official
    type: anthropic
    base_url: https://api.anthropic.com
    auth_type: oauth
    auth_value: oauth
    account_email: ops@example.com
  - name: openai-fallback
    type: openai
    base_url: https://api.openai.com/v1
    auth_type: api_key
    auth_value: sk-fallback
    proxy: http://127.0.0.1:7890
model_routes:
  - model: "*sonnet*"
    candidates:
      - provider: anthropic-official
        model: passthrough
        priority: 1
        account_email: ops@example.com
      - provider: openai-fallback
        model: gpt-4o
        priority: 2
settings:
  selection_strategy: round_robin
  failure_cooldown: 120
  unhealthy_threshold: 5
  timeouts:
    streaming:
      read_timeout: 300
    caching:
      deduplication_timeout: 90
  deduplication:
    enabled: true
    include_max_tokens_in_signature: true
    sse_error_cleanup_delay: 5
  oauth:
    enable_persistence: false
    service_name: my-proxy
  host: 0.0.0.0
  port: 9090
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.providers.len(), 2);
    assert_eq!(config.providers[0].provider_type, ProviderType::Anthropic);
    assert_eq!(
        config.providers[0].account_email.as_deref(),
        Some("ops@example.com")
    );
    assert_eq!(
        config.providers[1].proxy.as_deref(),
        Some("http://127.0.0.1:7890")
    );

    let route = &config.model_routes[0];
    assert_eq!(route.model, "*sonnet*");
    assert_eq!(route.candidates[0].model, "passthrough");
    assert_eq!(route.candidates[1].model, "gpt-4o");

    let settings = &config.settings;
    assert_eq!(settings.selection_strategy, SelectionStrategy::RoundRobin);
    assert_eq!(settings.failure_cooldown, 120);
    assert_eq!(settings.unhealthy_threshold, 5);
    assert_eq!(settings.timeouts.streaming.read_timeout, 300);
    // Untouched sections keep their defaults.
    assert_eq!(settings.timeouts.non_streaming.read_timeout, 60);
    assert_eq!(settings.timeouts.caching.deduplication_timeout, 90);
    assert!(settings.deduplication.include_max_tokens_in_signature);
    assert_eq!(settings.deduplication.sse_error_cleanup_delay, 5);
    assert!(!settings.oauth.enable_persistence);
    assert_eq!(settings.oauth.service_name, "my-proxy");
    assert_eq!(settings.host, "0.0.0.0");
    assert_eq!(settings.port, 9090);
}

#[test]
fn minimal_config_is_valid() {
    let yaml = r#"
providers:
  - name: only
    type: anthropic
    base_url: https://api.anthropic.com
    auth_type: api_key
    auth_value: sk-x
model_routes:
  - model: "*"
    candidates:
      - provider: only
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.settings.port, 8080);
    assert!(config.settings.deduplication.enabled);
    assert_eq!(config.model_routes[0].candidates[0].priority, 100);
}

#[test]
fn retired_settings_keys_are_collected_not_fatal() {
    let yaml = r#"
settings:
  failover_error_types: ["connection_error"]
  failover_http_codes: [502]
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert!(config.settings.unknown.contains_key("failover_error_types"));
    assert!(config.settings.unknown.contains_key("failover_http_codes"));
}

#[test]
fn load_rejects_route_to_unknown_provider() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
providers:
  - name: real
    type: anthropic
    base_url: https://api.anthropic.com
    auth_type: api_key
    auth_value: sk-x
model_routes:
  - model: "*sonnet*"
    candidates:
      - provider: imaginary
"#,
    )
    .unwrap();
    let err = switchboard::config::load(&path).unwrap_err();
    assert_eq!(err.code, "config_invalid");
    assert!(err.message.contains("imaginary"));
}

#[test]
fn load_rejects_duplicate_provider_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
providers:
  - name: twin
    type: anthropic
    base_url: https://a.example.com
    auth_type: api_key
    auth_value: sk-1
  - name: twin
    type: anthropic
    base_url: https://b.example.com
    auth_type: api_key
    auth_value: sk-2
"#,
    )
    .unwrap();
    let err = switchboard::config::load(&path).unwrap_err();
    assert_eq!(err.code, "config_invalid");
    assert!(err.message.contains("duplicate provider identity"));
}

#[test]
fn load_rejects_bad_body_pattern_regex() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
settings:
  unhealthy_response_body_patterns: ["(unclosed"]
"#,
    )
    .unwrap();
    let err = switchboard::config::load(&path).unwrap_err();
    assert_eq!(err.code, "config_invalid");
}

#[test]
fn missing_file_fails_load() {
    let err = switchboard::config::load(std::path::Path::new("/nonexistent/config.yaml"))
        .unwrap_err();
    assert_eq!(err.code, "config_read_failed");
}
