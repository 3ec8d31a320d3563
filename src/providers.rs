use crate::config::{Config, ProviderConfig};

/// Resolve a provider by name and an optional required account email.
///
/// A required account only matches the exact `(name, account_email)` entry.
/// Without one, an entry that also omits `account_email` wins over entries
/// that carry one, so shared-key providers are preferred for anonymous
/// candidates.
pub fn find<'a>(
    config: &'a Config,
    name: &str,
    account_email: Option<&str>,
) -> Option<&'a ProviderConfig> {
    match account_email {
        Some(email) => config
            .providers
            .iter()
            .find(|p| p.name == name && p.account_email.as_deref() == Some(email)),
        None => config
            .providers
            .iter()
            .find(|p| p.name == name && p.account_email.is_none())
            .or_else(|| config.providers.iter().find(|p| p.name == name)),
    }
}

/// Account emails of every oauth-typed provider, for startup token loading.
pub fn oauth_accounts(config: &Config) -> Vec<String> {
    let mut accounts: Vec<String> = config
        .providers
        .iter()
        .filter(|p| p.auth_type == crate::config::AuthType::Oauth)
        .filter_map(|p| p.account_email.clone())
        .collect();
    accounts.sort();
    accounts.dedup();
    accounts
}
