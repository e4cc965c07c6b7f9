use rustc_hash::FxHashSet;

use super::{AppConfig, ConfigError};

/// Semantic validation applied after YAML parsing.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] describing the first problem found.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.accounts.is_empty() {
        return Err(ConfigError::Validation(
            "at least one upstream account is required".to_string(),
        ));
    }

    let mut account_ids = FxHashSet::default();
    for account in &config.accounts {
        if account.id.is_empty() {
            return Err(ConfigError::Validation(
                "account id must not be empty".to_string(),
            ));
        }
        if !account_ids.insert(account.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate account id '{}'",
                account.id
            )));
        }
        if account.api_key.is_empty() {
            return Err(ConfigError::Validation(format!(
                "account '{}' has an empty api_key",
                account.id
            )));
        }
        validate_http_url(&account.base_api, &format!("account '{}' base_api", account.id))?;
        if let Some(proxy) = account.proxy.as_deref() {
            validate_http_url(proxy, &format!("account '{}' proxy", account.id))?;
        }
    }

    if config.client_keys.is_empty() {
        return Err(ConfigError::Validation(
            "at least one client key is required".to_string(),
        ));
    }

    let mut client_keys = FxHashSet::default();
    for client_key in &config.client_keys {
        if client_key.key.is_empty() {
            return Err(ConfigError::Validation(format!(
                "client key '{}' has an empty key",
                client_key.id
            )));
        }
        if !client_keys.insert(client_key.key.as_str()) {
            return Err(ConfigError::Validation(format!(
                "client key '{}' duplicates another key value",
                client_key.id
            )));
        }
        if client_key.permissions.is_empty() {
            return Err(ConfigError::Validation(format!(
                "client key '{}' has no permissions",
                client_key.id
            )));
        }
    }

    Ok(())
}

fn validate_http_url(raw: &str, context: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(raw)
        .map_err(|err| ConfigError::Validation(format!("{context} is not a valid URL: {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::Validation(format!(
            "{context} must use http or https"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientKeyConfig, FeaturesConfig, ServerConfig, UpstreamAccountConfig};

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            accounts: vec![UpstreamAccountConfig {
                id: "a".to_string(),
                kind: crate::accounts::AccountKind::OpenAi,
                api_key: "sk-a".to_string(),
                base_api: "https://api.example.com/v1".to_string(),
                user_agent: None,
                proxy: None,
            }],
            client_keys: vec![ClientKeyConfig {
                id: "k".to_string(),
                key: "sk-client".to_string(),
                permissions: vec![crate::auth::Permission::All],
                allowed_models: Vec::new(),
            }],
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_accounts_rejected() {
        let mut config = valid_config();
        config.accounts.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_account_ids_rejected() {
        let mut config = valid_config();
        let duplicate = config.accounts[0].clone();
        config.accounts.push(duplicate);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_bad_base_api_rejected() {
        let mut config = valid_config();
        config.accounts[0].base_api = "ftp://example.com".to_string();
        assert!(validate_config(&config).is_err());

        config.accounts[0].base_api = "not a url".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_client_keys_rejected() {
        let mut config = valid_config();
        config.client_keys.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_no_permissions_rejected() {
        let mut config = valid_config();
        config.client_keys[0].permissions.clear();
        assert!(validate_config(&config).is_err());
    }
}
