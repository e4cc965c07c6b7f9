use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

static MESSAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
const HEX: &[u8; 16] = b"0123456789abcdef";
const SESSION_HASH_PREFIX_MAX_BYTES: usize = 512;

/// Generate a downstream message id (`msg_<16 hex>`) from a process-wide
/// counter.
#[must_use]
pub(crate) fn new_message_id() -> String {
    let id = MESSAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(20);
    out.push_str("msg_");
    push_u64_hex_16(&mut out, id);
    out
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    for slot in buf.iter_mut().rev() {
        *slot = HEX[(value & 0x0f) as usize];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Compact request-body hash handed to the account scheduler as a session hint.
///
/// Hashes a capped prefix plus the total length so large bodies stay cheap.
#[must_use]
pub(crate) fn session_hash(body: &[u8]) -> u64 {
    let sample = &body[..body.len().min(SESSION_HASH_PREFIX_MAX_BYTES)];
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(sample);
    hasher.write_usize(body.len());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique_and_prefixed() {
        let first = new_message_id();
        let second = new_message_id();
        assert!(first.starts_with("msg_"));
        assert_eq!(first.len(), 4 + 16);
        assert!(first[4..].bytes().all(|byte| byte.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn hex_formatting_is_zero_padded() {
        let mut out = String::new();
        push_u64_hex_16(&mut out, 0x1234_abcd);
        assert_eq!(out, "000000001234abcd");

        let mut out = String::new();
        push_u64_hex_16(&mut out, u64::MAX);
        assert_eq!(out, "ffffffffffffffff");
    }

    #[test]
    fn session_hash_depends_on_tail_length() {
        let long_a = vec![b'x'; 2048];
        let long_b = vec![b'x'; 4096];
        assert_ne!(session_hash(&long_a), session_hash(&long_b));
        assert_eq!(session_hash(&long_a), session_hash(&long_a.clone()));
    }
}
