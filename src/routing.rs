use crate::config::{Config, ModelRoute, ProviderConfig, SelectionStrategy, PASSTHROUGH};
use crate::health::HealthTracker;
use crate::providers;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One attemptable upstream: a concrete provider entry plus the model string
/// to send it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: ProviderConfig,
    pub upstream_model: String,
    pub priority: i32,
}

/// Per-route cursors for round-robin selection. Keyed by route pattern;
/// advances once per resolution.
#[derive(Clone, Default)]
pub struct RouteCursors {
    inner: Arc<Mutex<HashMap<String, u64>>>,
}

impl RouteCursors {
    pub fn new() -> Self {
        Self::default()
    }

    async fn advance(&self, route: &str) -> u64 {
        let mut guard = self.inner.lock().await;
        let cursor = guard.entry(route.to_string()).or_insert(0);
        let current = *cursor;
        *cursor = cursor.wrapping_add(1);
        current
    }
}

pub fn glob_match(pattern: &str, model: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut regex = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex::RegexBuilder::new(&regex)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(model))
        .unwrap_or(false)
}

/// Exact-name routes win; glob routes are scanned in configuration order.
pub fn find_route<'a>(config: &'a Config, model: &str) -> Option<&'a ModelRoute> {
    config
        .model_routes
        .iter()
        .find(|route| !route.model.contains('*') && route.model == model)
        .or_else(|| {
            config
                .model_routes
                .iter()
                .filter(|route| route.model.contains('*'))
                .find(|route| glob_match(&route.model, model))
        })
}

/// Produce the ordered, health-filtered candidate list for a client model.
/// Returns `None` when no route pattern matches at all; an empty vector means
/// a route matched but every candidate is disabled or cooling down.
pub async fn resolve(
    config: &Config,
    health: &HealthTracker,
    cursors: &RouteCursors,
    client_model: &str,
    now: i64,
) -> Option<Vec<Candidate>> {
    let route = find_route(config, client_model)?;

    let mut candidates: Vec<Candidate> = Vec::new();
    for entry in &route.candidates {
        let Some(provider) =
            providers::find(config, &entry.provider, entry.account_email.as_deref())
        else {
            tracing::warn!(
                route = %route.model,
                provider = %entry.provider,
                account = entry.account_email.as_deref().unwrap_or("-"),
                "route candidate resolves to no provider entry"
            );
            continue;
        };
        if !provider.enabled {
            continue;
        }
        if !health
            .is_eligible(&provider.key(), &config.settings, now)
            .await
        {
            continue;
        }
        let upstream_model = if entry.model == PASSTHROUGH {
            client_model.to_string()
        } else {
            entry.model.clone()
        };
        candidates.push(Candidate {
            provider: provider.clone(),
            upstream_model,
            priority: entry.priority,
        });
    }

    // Candidates keep configuration order within equal priorities.
    candidates.sort_by_key(|c| c.priority);

    match config.settings.selection_strategy {
        SelectionStrategy::Priority => {}
        SelectionStrategy::RoundRobin => {
            let cursor = cursors.advance(&route.model).await;
            rotate_priority_groups(&mut candidates, cursor);
        }
        SelectionStrategy::Random => shuffle(&mut candidates),
    }

    Some(candidates)
}

/// Rotate each equal-priority run by the shared cursor so every member leads
/// within a window of the group's size.
fn rotate_priority_groups(candidates: &mut [Candidate], cursor: u64) {
    let mut start = 0;
    while start < candidates.len() {
        let priority = candidates[start].priority;
        let mut end = start;
        while end < candidates.len() && candidates[end].priority == priority {
            end += 1;
        }
        let group = &mut candidates[start..end];
        let len = group.len();
        if len > 1 {
            group.rotate_left((cursor % len as u64) as usize);
        }
        start = end;
    }
}

fn shuffle(candidates: &mut Vec<Candidate>) {
    let mut shuffled = Vec::with_capacity(candidates.len());
    while !candidates.is_empty() {
        let idx = (random_u64(candidates.len() as u64)) as usize;
        shuffled.push(candidates.swap_remove(idx));
    }
    *candidates = shuffled;
}

fn random_u64(bound: u64) -> u64 {
    if bound <= 1 {
        return 0;
    }
    let seed = uuid::Uuid::new_v4().as_u128() as u64;
    seed % bound
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    const BASE: &str = r#"
providers:
  - name: primary
    type: anthropic
    base_url: https://primary.example.com
    auth_type: api_key
    auth_value: sk-1
  - name: secondary
    type: openai
    base_url: https://secondary.example.com
    auth_type: api_key
    auth_value: sk-2
  - name: tertiary
    type: openai
    base_url: https://tertiary.example.com
    auth_type: api_key
    auth_value: sk-3
model_routes:
  - model: claude-3-5-sonnet-latest
    candidates:
      - provider: secondary
        model: gpt-4o
        priority: 1
  - model: "*sonnet*"
    candidates:
      - provider: primary
        priority: 1
      - provider: secondary
        model: gpt-4o
        priority: 2
"#;

    #[test]
    fn glob_is_case_insensitive_substring() {
        assert!(glob_match("*sonnet*", "claude-3-5-SONNET-20241022"));
        assert!(glob_match("*Sonnet*", "claude-sonnet-4"));
        assert!(!glob_match("*opus*", "claude-3-5-sonnet"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn exact_route_wins_over_glob() {
        let config = config(BASE);
        let route = find_route(&config, "claude-3-5-sonnet-latest").unwrap();
        assert_eq!(route.candidates.len(), 1);
        assert_eq!(route.candidates[0].provider, "secondary");
        let route = find_route(&config, "claude-3-sonnet").unwrap();
        assert_eq!(route.candidates.len(), 2);
    }

    #[tokio::test]
    async fn passthrough_model_forwards_client_string() {
        let config = config(BASE);
        let health = HealthTracker::new();
        let cursors = RouteCursors::new();
        let candidates = resolve(&config, &health, &cursors, "claude-3-sonnet", 0)
            .await
            .unwrap();
        assert_eq!(candidates[0].upstream_model, "claude-3-sonnet");
        assert_eq!(candidates[1].upstream_model, "gpt-4o");
    }

    #[tokio::test]
    async fn unknown_model_has_no_route() {
        let config = config(BASE);
        let health = HealthTracker::new();
        let cursors = RouteCursors::new();
        assert!(resolve(&config, &health, &cursors, "gemini-pro", 0)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn unhealthy_provider_filtered_out() {
        let config = config(BASE);
        let health = HealthTracker::new();
        let cursors = RouteCursors::new();
        let settings = &config.settings;
        for _ in 0..settings.unhealthy_threshold {
            health.record_failure("primary", settings, 1_000).await;
        }
        let candidates = resolve(&config, &health, &cursors, "claude-3-sonnet", 1_001)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider.name, "secondary");
    }

    #[tokio::test]
    async fn round_robin_covers_equal_priority_group() {
        let yaml = r#"
providers:
  - name: a
    type: openai
    base_url: https://a.example.com
    auth_type: api_key
    auth_value: k
  - name: b
    type: openai
    base_url: https://b.example.com
    auth_type: api_key
    auth_value: k
  - name: c
    type: openai
    base_url: https://c.example.com
    auth_type: api_key
    auth_value: k
model_routes:
  - model: "*gpt*"
    candidates:
      - { provider: a, model: m, priority: 1 }
      - { provider: b, model: m, priority: 1 }
      - { provider: c, model: m, priority: 1 }
settings:
  selection_strategy: round_robin
"#;
        let config = config(yaml);
        let health = HealthTracker::new();
        let cursors = RouteCursors::new();
        let mut leaders = Vec::new();
        for _ in 0..3 {
            let candidates = resolve(&config, &health, &cursors, "gpt-x", 0)
                .await
                .unwrap();
            leaders.push(candidates[0].provider.name.clone());
        }
        leaders.sort();
        assert_eq!(leaders, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn priority_order_is_deterministic() {
        let config = config(BASE);
        let health = HealthTracker::new();
        let cursors = RouteCursors::new();
        for _ in 0..5 {
            let candidates = resolve(&config, &health, &cursors, "claude-3-sonnet", 0)
                .await
                .unwrap();
            let names: Vec<&str> = candidates.iter().map(|c| c.provider.name.as_str()).collect();
            assert_eq!(names, vec!["primary", "secondary"]);
        }
    }

    #[test]
    fn rotation_is_scoped_to_priority_groups() {
        let provider = |name: &str| ProviderConfig {
            name: name.to_string(),
            provider_type: crate::config::ProviderType::Openai,
            base_url: "https://x.example.com".to_string(),
            auth_type: crate::config::AuthType::ApiKey,
            auth_value: "k".to_string(),
            account_email: None,
            proxy: None,
            enabled: true,
        };
        let candidate = |name: &str, priority: i32| Candidate {
            provider: provider(name),
            upstream_model: "m".to_string(),
            priority,
        };
        let mut candidates = vec![
            candidate("a", 1),
            candidate("b", 1),
            candidate("lone", 2),
        ];
        rotate_priority_groups(&mut candidates, 1);
        let names: Vec<&str> = candidates.iter().map(|c| c.provider.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "lone"]);
    }
}
