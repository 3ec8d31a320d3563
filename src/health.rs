use crate::config::Settings;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub last_error_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub cooldown_until: Option<i64>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_errors: 0,
            last_error_at: None,
            last_success_at: None,
            cooldown_until: None,
        }
    }
}

/// Passive per-provider health, keyed by provider identity. One mutex guards
/// the transition bookkeeping; entries are created lazily on first use.
#[derive(Clone, Default)]
pub struct HealthTracker {
    inner: Arc<Mutex<HashMap<String, ProviderHealth>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider may be selected while healthy, once its cooldown has
    /// elapsed, or once the reset timeout since its last error has passed.
    /// The reset-timeout recovery is applied lazily here rather than by a
    /// background task.
    pub async fn is_eligible(&self, key: &str, settings: &Settings, now: i64) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(entry) = guard.get_mut(key) else {
            return true;
        };
        if entry.healthy {
            return true;
        }
        if let Some(last_error_at) = entry.last_error_at {
            if now.saturating_sub(last_error_at) >= settings.unhealthy_reset_timeout as i64 {
                entry.healthy = true;
                entry.consecutive_errors = 0;
                entry.cooldown_until = None;
                tracing::info!(provider = %key, "provider recovered after reset timeout");
                return true;
            }
        }
        entry.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }

    pub async fn record_success(&self, key: &str, settings: &Settings, now: i64) {
        let mut guard = self.inner.lock().await;
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(ProviderHealth::new);
        let was_unhealthy = !entry.healthy;
        entry.healthy = true;
        entry.last_success_at = Some(now);
        entry.cooldown_until = None;
        if settings.unhealthy_reset_on_success {
            entry.consecutive_errors = 0;
        }
        if was_unhealthy {
            tracing::info!(provider = %key, "provider recovered to healthy after success");
        }
    }

    pub async fn record_failure(&self, key: &str, settings: &Settings, now: i64) {
        let mut guard = self.inner.lock().await;
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(ProviderHealth::new);
        entry.consecutive_errors = entry.consecutive_errors.saturating_add(1);
        entry.last_error_at = Some(now);
        if entry.consecutive_errors >= settings.unhealthy_threshold {
            entry.healthy = false;
            entry.cooldown_until = Some(now + settings.failure_cooldown as i64);
            tracing::info!(
                provider = %key,
                consecutive_errors = entry.consecutive_errors,
                cooldown_seconds = settings.failure_cooldown,
                "provider marked unhealthy after consecutive failures"
            );
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.inner.lock().await.clone()
    }
}
