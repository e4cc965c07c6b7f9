use std::sync::Arc;

use crate::accounts::{AccountSelector, ConfigAccountSelector, RateLimitTracker};
use crate::auth::{KeyGrant, KeyGrantIndex};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::observability::UsageRecorder;
use crate::upstream::UpstreamClient;

/// Shared application state accessible to all handlers.
///
/// The selector, rate-limit tracker, and usage recorder are process-shared
/// and safe for concurrent use; per-session stream state lives with each
/// request instead.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamClient,
    pub accounts: Arc<dyn AccountSelector>,
    pub rate_limits: Arc<RateLimitTracker>,
    pub usage: UsageRecorder,
    key_grants: KeyGrantIndex,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let rate_limits = Arc::new(RateLimitTracker::new());
        let accounts: Arc<dyn AccountSelector> = Arc::new(ConfigAccountSelector::new(
            &config.accounts,
            Arc::clone(&rate_limits),
        ));
        let key_grants = KeyGrantIndex::from_config(&config);
        let upstream = UpstreamClient::new(&config.server);
        Self {
            config,
            upstream,
            accounts,
            rate_limits,
            usage: UsageRecorder::new(),
            key_grants,
        }
    }

    /// Authenticate an ingress request using the prebuilt key index.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Auth`] when the API key is missing or invalid.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<Arc<KeyGrant>, GatewayError> {
        self.key_grants.authenticate(headers)
    }
}
