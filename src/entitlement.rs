//! Subscription entitlement checks.
//!
//! The rules deciding whether a subscription is active live in the hosted
//! database; this module only asks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The subscription row that backs an entitlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub id: String,
    #[serde(rename = "user_id")]
    pub subject_id: String,
    #[serde(default)]
    pub plan: Option<String>,
    /// `None` for lifetime subscriptions.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait EntitlementOracle: Send + Sync {
    /// Whether `subject_id` holds an active subscription right now.
    async fn has_active_entitlement(&self, subject_id: &str) -> anyhow::Result<bool>;

    /// The record backing the active subscription, if any.
    async fn active_entitlement(
        &self,
        subject_id: &str,
    ) -> anyhow::Result<Option<EntitlementRecord>>;
}
