use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::Instrument;

use crate::middleware::{REQUEST_CONTEXT, with_request_info};

/// Audit macro for logging download authorization events.
///
/// This macro wraps `tracing::info!` and automatically adds `audit=true`
/// and `auditType="download"` metadata to the log event.
///
/// # Examples
///
/// ```ignore
/// audit!("Issued download token for {}", subject_id);
/// ```
#[macro_export]
macro_rules! audit {
    ($($arg:tt)+) => {
        $crate::middleware::with_request_info(|ctx| {
            tracing::info!(
                audit = true,
                auditType = "download",
                requestId = %ctx.request_id,
                endpoint = %ctx.endpoint,
                host = %ctx.host,
                httpMethod = %ctx.method,
                $($arg)+
            )
        })
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Issued,
    Redeemed,
}

/// One row of the download audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    #[serde(rename = "user_id")]
    pub subject_id: String,
    #[serde(rename = "product_id")]
    pub resource_id: String,
    #[serde(rename = "subscription_id")]
    pub entitlement_id: String,
    pub occurred_at: DateTime<Utc>,
    /// Token expiry, recorded on issuance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Truncated digest of the token, recorded on redemption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_fingerprint: Option<String>,
}

/// Append-only sink for [`AuditEvent`]s.
///
/// Callers treat failures as non-fatal: a lost audit row never turns a
/// successful issuance or redemption into an error.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Writes `event` on a background task and returns immediately. The task
/// keeps the caller's span and request context.
pub fn record(log: Arc<dyn AuditLog>, event: AuditEvent) {
    let ctx = with_request_info(|ctx| ctx.clone());
    let task = REQUEST_CONTEXT.scope(ctx, async move { write(log.as_ref(), event).await });
    tokio::spawn(task.in_current_span());
}

/// Logs and discards any failure.
async fn write(log: &dyn AuditLog, event: AuditEvent) {
    let action = event.action;
    if let Err(e) = log.append(event).await {
        with_request_info(|ctx| {
            tracing::warn!(
                error = %e,
                ?action,
                requestId = %ctx.request_id,
                "failed to write download audit entry"
            )
        });
    }
}
