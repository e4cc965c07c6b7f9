use serde_json::{json, Value};

/// Typed error surfaced by the dispatch pipeline.
///
/// Every variant maps to one row of the downstream error table: an HTTP
/// status plus an Anthropic-shaped `{type:"error", error:{...}}` envelope.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Model not permitted: {0}")]
    ModelRestricted(String),
    #[error("No upstream account available: {0}")]
    NoAccount(String),
    #[error("Upstream account misconfigured: {0}")]
    MisconfiguredAccount(String),
    #[error("Upstream returned status {status}")]
    Upstream { status: u16, body: String },
    #[error("Upstream response parse error: {0}")]
    Parse(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => http::StatusCode::UNAUTHORIZED,
            GatewayError::PermissionDenied(_) | GatewayError::ModelRestricted(_) => {
                http::StatusCode::FORBIDDEN
            }
            GatewayError::NoAccount(_) | GatewayError::MisconfiguredAccount(_) => {
                http::StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Upstream { status, .. } => {
                http::StatusCode::from_u16(*status).unwrap_or(http::StatusCode::BAD_GATEWAY)
            }
            GatewayError::Parse(_) => http::StatusCode::BAD_GATEWAY,
            GatewayError::Config(_) | GatewayError::Transport(_) => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::ModelRestricted(_) => {
                "invalid_request_error"
            }
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::PermissionDenied(_) => "permission_error",
            GatewayError::NoAccount(_) => "overloaded_error",
            GatewayError::MisconfiguredAccount(_) => "configuration_error",
            GatewayError::Config(_)
            | GatewayError::Upstream { .. }
            | GatewayError::Parse(_)
            | GatewayError::Transport(_) => "api_error",
        }
    }
}

/// Build the downstream error envelope for an error.
///
/// Upstream HTTP failures forward the upstream `error` object when the body
/// carries one; everything else gets a locally-shaped envelope.
#[must_use]
pub fn error_envelope(err: &GatewayError) -> Value {
    if let GatewayError::Upstream { body, .. } = err {
        return upstream_envelope(body);
    }
    json!({
        "type": "error",
        "error": {
            "type": err.error_type(),
            "message": err.to_string(),
        }
    })
}

fn upstream_envelope(body: &str) -> Value {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(mut map)) => {
            let error = match map.remove("error") {
                Some(error @ Value::Object(_)) => error,
                _ => json!({"type": "api_error", "message": Value::Object(map).to_string()}),
            };
            json!({"type": "error", "error": error})
        }
        _ => json!({
            "type": "error",
            "error": {"type": "api_error", "message": body},
        }),
    }
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        use axum::response::IntoResponse;
        let status = self.status_code();
        let body = error_envelope(&self);
        (status, axum::Json(body)).into_response()
    }
}
