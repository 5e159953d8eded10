// =============================================================================
// Client order ids — deterministic idempotency keys for venue submission
// =============================================================================
//
// The id is a truncated SHA-256 digest of the order's identifying fields.
// Replaying the same signal therefore regenerates the same id, and the venue
// treats the second submission as a duplicate of the first.
// =============================================================================

use sha2::{Digest, Sha256};

/// Number of digest bytes kept; 12 bytes hex-encode to 24 characters.
const DIGEST_BYTES: usize = 12;

/// Generate a deterministic, collision-resistant client order id.
///
/// The digest input is `strategy|symbol|side|timestamp_ns|nonce`, so two
/// orders differ in id as soon as any identifying field differs. The entry
/// order of a signal uses nonce 0; its protective stop uses nonce 1.
pub fn make_client_order_id(
    strategy: &str,
    symbol: &str,
    side: &str,
    timestamp_ns: i64,
    nonce: u32,
) -> String {
    let payload = format!("{strategy}|{symbol}|{side}|{timestamp_ns}|{nonce}");
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode(&digest[..DIGEST_BYTES])
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic() {
        let a = make_client_order_id("trend", "BTC/USDT", "buy", 1_700_000_000_000_000_000, 0);
        let b = make_client_order_id("trend", "BTC/USDT", "buy", 1_700_000_000_000_000_000, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn id_is_24_hex_chars() {
        let id = make_client_order_id("trend", "BTC/USDT", "buy", 1_700_000_000_000_000_000, 0);
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_inputs_produce_distinct_ids() {
        let entry = make_client_order_id("trend", "BTC/USDT", "buy", 1_700_000_000_000_000_000, 0);
        let stop = make_client_order_id("trend", "BTC/USDT", "sell", 1_700_000_000_000_000_000, 1);
        let other_symbol =
            make_client_order_id("trend", "ETH/USDT", "buy", 1_700_000_000_000_000_000, 0);
        let other_ts = make_client_order_id("trend", "BTC/USDT", "buy", 1_700_000_000_000_000_001, 0);
        assert_ne!(entry, stop);
        assert_ne!(entry, other_symbol);
        assert_ne!(entry, other_ts);
    }
}
