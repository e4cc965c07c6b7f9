//! Upstream account selection and rate-limit bookkeeping.
//!
//! The dispatch pipeline treats the selector as an opaque scheduler: it asks
//! for credentials, optionally refetches once when they come back redacted,
//! and reports 429s so throttled accounts drop out of rotation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::UpstreamAccountConfig;
use crate::error::GatewayError;

/// Fallback window when a 429 carries no usable reset hint.
pub const DEFAULT_RATE_LIMIT_RESET_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
}

#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub api_key: String,
    pub base_api: String,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamAccount {
    pub id: String,
    pub kind: AccountKind,
    pub credentials: AccountCredentials,
}

impl UpstreamAccount {
    /// Whether the credentials can actually be sent upstream. Selectors may
    /// return redacted material that needs a follow-up fetch by id.
    #[must_use]
    pub fn credentials_usable(&self) -> bool {
        !self.credentials.api_key.is_empty()
            && !self.credentials.api_key.starts_with("[redacted")
            && !self.credentials.base_api.is_empty()
    }
}

/// Chooses an upstream account for a request.
pub trait AccountSelector: Send + Sync {
    /// # Errors
    ///
    /// Returns [`GatewayError::NoAccount`] when nothing is selectable.
    fn select(
        &self,
        api_key_id: &str,
        session_hash: u64,
        model: &str,
    ) -> Result<UpstreamAccount, GatewayError>;

    fn get_by_id(&self, account_id: &str) -> Option<UpstreamAccount>;
}

/// Config-backed selector: round-robin over accounts not currently
/// rate limited.
pub struct ConfigAccountSelector {
    accounts: Vec<UpstreamAccount>,
    rate_limits: Arc<RateLimitTracker>,
    cursor: AtomicUsize,
}

impl ConfigAccountSelector {
    #[must_use]
    pub fn new(accounts: &[UpstreamAccountConfig], rate_limits: Arc<RateLimitTracker>) -> Self {
        let accounts = accounts
            .iter()
            .map(|account| UpstreamAccount {
                id: account.id.clone(),
                kind: account.kind,
                credentials: AccountCredentials {
                    api_key: account.api_key.clone(),
                    base_api: account.base_api.clone(),
                    user_agent: account.user_agent.clone(),
                    proxy: account.proxy.clone(),
                },
            })
            .collect();
        Self {
            accounts,
            rate_limits,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl AccountSelector for ConfigAccountSelector {
    fn select(
        &self,
        _api_key_id: &str,
        _session_hash: u64,
        model: &str,
    ) -> Result<UpstreamAccount, GatewayError> {
        if self.accounts.is_empty() {
            return Err(GatewayError::NoAccount(
                "no upstream accounts configured".to_string(),
            ));
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.accounts.len() {
            let account = &self.accounts[(start + offset) % self.accounts.len()];
            if !self.rate_limits.is_rate_limited(&account.id) {
                return Ok(account.clone());
            }
        }
        Err(GatewayError::NoAccount(format!(
            "all upstream accounts are rate limited (model '{model}')"
        )))
    }

    fn get_by_id(&self, account_id: &str) -> Option<UpstreamAccount> {
        self.accounts
            .iter()
            .find(|account| account.id == account_id)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Rate-limit tracker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RateLimitEntry {
    kind: AccountKind,
    session_hash: u64,
    resets_at: Instant,
}

/// Process-shared rate-limit flags keyed by account id.
///
/// Entries expire on their reset deadline; `is_rate_limited` treats an
/// expired entry as clear without mutating the map.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    entries: RwLock<FxHashMap<String, RateLimitEntry>>,
}

impl RateLimitTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_rate_limited(
        &self,
        account_id: &str,
        kind: AccountKind,
        session_hash: u64,
        resets_in_seconds: Option<u64>,
    ) {
        let resets_in = resets_in_seconds.unwrap_or(DEFAULT_RATE_LIMIT_RESET_SECS);
        tracing::warn!(
            account_id,
            resets_in_seconds = resets_in,
            "marking upstream account rate limited"
        );
        self.entries.write().insert(
            account_id.to_string(),
            RateLimitEntry {
                kind,
                session_hash,
                resets_at: Instant::now() + Duration::from_secs(resets_in),
            },
        );
    }

    #[must_use]
    pub fn is_rate_limited(&self, account_id: &str) -> bool {
        self.entries
            .read()
            .get(account_id)
            .is_some_and(|entry| Instant::now() < entry.resets_at)
    }

    pub fn remove_rate_limit(&self, account_id: &str, kind: AccountKind) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(account_id) {
            if entry.kind != kind {
                return;
            }
            tracing::info!(
                account_id,
                session_hash = entry.session_hash,
                "clearing rate-limit flag after successful completion"
            );
            entries.remove(account_id);
        }
    }
}

// ---------------------------------------------------------------------------
// 429 reset-hint parsing
// ---------------------------------------------------------------------------

/// Extract a reset interval in seconds from a 429 error body.
///
/// Preference order: a `msg` stamp of the form `YYYY-MM-DD HH:MM:SS UTC+N`,
/// then a numeric `resets_in_seconds` field. Returns `None` when neither is
/// usable; callers fall back to [`DEFAULT_RATE_LIMIT_RESET_SECS`].
#[must_use]
pub fn parse_reset_hint(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    for scope in [Some(&value), value.get("error")] {
        let Some(scope) = scope else { continue };
        if let Some(msg) = scope.get("msg").and_then(serde_json::Value::as_str) {
            if let Some(seconds) = seconds_until_reset_stamp(msg) {
                return Some(seconds);
            }
        }
        if let Some(seconds) = scope
            .get("resets_in_seconds")
            .and_then(serde_json::Value::as_u64)
        {
            return Some(seconds);
        }
    }
    None
}

fn seconds_until_reset_stamp(msg: &str) -> Option<u64> {
    let utc_pos = msg.find("UTC")?;
    let stamp_end = msg[..utc_pos].trim_end();
    let stamp = stamp_end.get(stamp_end.len().checked_sub(19)?..)?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").ok()?;

    let offset_hours = parse_offset_hours(&msg[utc_pos + 3..]);
    let offset = FixedOffset::east_opt(offset_hours * 3600)?;
    let reset = offset.from_local_datetime(&naive).single()?;

    let delta = reset.signed_duration_since(Utc::now()).num_seconds();
    u64::try_from(delta).ok().filter(|seconds| *seconds > 0)
}

fn parse_offset_hours(tail: &str) -> i32 {
    let mut chars = tail.chars().peekable();
    let negative = match chars.peek() {
        Some('-') => {
            chars.next();
            true
        }
        Some('+') => {
            chars.next();
            false
        }
        _ => false,
    };
    let mut hours = 0i32;
    for ch in chars {
        let Some(digit) = ch.to_digit(10) else { break };
        hours = hours * 10 + digit as i32;
        if hours > 14 {
            return 0;
        }
    }
    if negative {
        -hours
    } else {
        hours
    }
}
