use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler: status plus a small config and usage summary.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (requests, input_tokens, output_tokens) = state.usage.totals();
    Json(json!({
        "status": "ok",
        "accounts": state.config.accounts.len(),
        "client_keys": state.config.client_keys.len(),
        "usage": {
            "requests": requests,
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        },
    }))
}
