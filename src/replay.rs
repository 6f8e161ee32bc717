//! Optional at-most-once redemption.
//!
//! Download tokens are stateless, so a redeemed token stays valid until it
//! expires. When `single_use_tokens` is enabled, redemption records each
//! token's fingerprint here. An entry outlives its token: entries live for one
//! full TTL, and a token never has more than that left.

use moka::future::Cache;
use std::time::Duration;

#[derive(Clone)]
pub struct RedeemedTokens {
    seen: Cache<String, ()>,
}

impl RedeemedTokens {
    pub fn new(token_ttl: Duration) -> Self {
        let seen = Cache::builder().time_to_live(token_ttl).build();
        Self { seen }
    }

    /// Marks `fingerprint` as redeemed. Returns `false` if it already was.
    ///
    /// Concurrent calls for the same fingerprint see exactly one `true`.
    pub async fn mark(&self, fingerprint: &str) -> bool {
        self.seen
            .entry(fingerprint.to_string())
            .or_insert(())
            .await
            .is_fresh()
    }
}
