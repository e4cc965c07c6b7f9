use std::sync::Arc;

use http::header::HeaderName;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::GatewayError;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// What a configured client key is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    All,
    OpenAi,
    /// Reserved for keys scoped to other upstream families; such keys are
    /// rejected by this gateway's permission gate.
    Claude,
}

/// Key metadata attached to an authenticated request.
///
/// The dispatch pipeline consumes this contract opaquely: permission and
/// model gates read it, nothing else does.
#[derive(Debug, Clone)]
pub struct KeyGrant {
    pub id: String,
    pub permissions: Vec<Permission>,
    pub allowed_models: Vec<String>,
}

impl KeyGrant {
    /// Whether this key may use the OpenAI-backed messages surface.
    #[must_use]
    pub fn allows_openai(&self) -> bool {
        self.permissions
            .iter()
            .any(|permission| matches!(permission, Permission::All | Permission::OpenAi))
    }

    /// Empty restriction list means every model is allowed.
    #[must_use]
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|allowed| allowed == model)
    }
}

/// Pre-indexed client keys for hot-path lookup.
pub struct KeyGrantIndex {
    grants: FxHashMap<String, Arc<KeyGrant>>,
}

impl KeyGrantIndex {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let mut grants = FxHashMap::default();
        for client_key in &config.client_keys {
            grants.insert(
                client_key.key.clone(),
                Arc::new(KeyGrant {
                    id: client_key.id.clone(),
                    permissions: client_key.permissions.clone(),
                    allowed_models: client_key.allowed_models.clone(),
                }),
            );
        }
        Self { grants }
    }

    /// Resolve the `x-api-key` header into a grant.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Auth`] when the header is missing or unknown.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<Arc<KeyGrant>, GatewayError> {
        let key = headers
            .get(X_API_KEY)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| GatewayError::Auth("Missing API key".to_string()))?;
        self.grants
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::Auth("Invalid API key".to_string()))
    }
}
