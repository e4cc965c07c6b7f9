use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Fire-and-forget usage accounting.
///
/// Per-request detail goes to the structured log; process-wide totals are
/// atomics so recording never blocks a streaming path.
#[derive(Debug, Default)]
pub struct UsageRecorder {
    requests: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl UsageRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        key_id: &str,
        account_id: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(output_tokens, Ordering::Relaxed);
        info!(
            key = key_id,
            account = account_id,
            model,
            input_tokens,
            output_tokens,
            "request completed"
        );
    }

    /// `(requests, input_tokens, output_tokens)` since process start.
    #[must_use]
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate() {
        let recorder = UsageRecorder::new();
        recorder.record("k", "a", "m", 10, 5);
        recorder.record("k", "a", "m", 1, 2);
        assert_eq!(recorder.totals(), (2, 11, 7));
    }
}
