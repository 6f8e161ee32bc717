use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Claims carried inside a download token.
///
/// Immutable once issued; a token only ever expires, it is never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClaim {
    /// Authenticated principal the token was issued to.
    pub subject_id: String,
    /// Product the token unlocks.
    pub resource_id: String,
    /// Subscription record that justified issuance. Kept for traceability,
    /// redemption re-checks the subject's current entitlement instead.
    pub entitlement_id: String,
    /// Random nonce distinguishing tokens minted in the same second.
    pub token_id: String,
    /// Issued at (UNIX timestamp).
    pub issued_at: u64,
    /// Expiration time (UNIX timestamp).
    pub expires_at: u64,
}

impl DownloadClaim {
    /// Seconds left before expiry, as seen at `now`.
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// Expiry as a UTC datetime, for RFC 3339 rendering.
    pub fn expires_at_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.expires_at as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }
}

/// The parts of a claim chosen by the issuer; timestamps and the nonce are
/// assigned by the codec.
#[derive(Debug, Clone)]
pub struct Grant {
    pub subject_id: String,
    pub resource_id: String,
    pub entitlement_id: String,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generates a random 16-character alphanumeric token id.
pub fn generate_token_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
