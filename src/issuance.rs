//! Logic for the `/issuance` endpoint.
//!
//! First half of the download handshake: an authenticated subscriber asks
//! for a short-lived token that unlocks one product.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::{self, AuditAction, AuditEvent, AuditLog};
use crate::catalog::{Catalog, Product};
use crate::claims::{DownloadClaim, Grant, unix_now};
use crate::codec::TokenCodec;
use crate::entitlement::EntitlementOracle;
use crate::error::error_response;
use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error("Authentication required")]
    Unauthenticated,
    #[error("resourceId is required")]
    MissingResourceId,
    #[error("Product not found")]
    ResourceNotFound,
    #[error("An active subscription is required to download ebooks")]
    EntitlementRequired,
    #[error("Subscription record could not be found")]
    EntitlementLookupFailed,
    #[error("Failed to generate download token")]
    Unexpected(#[source] anyhow::Error),
}

impl IssuanceError {
    pub fn status(&self) -> StatusCode {
        match self {
            IssuanceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            IssuanceError::MissingResourceId => StatusCode::BAD_REQUEST,
            IssuanceError::ResourceNotFound => StatusCode::NOT_FOUND,
            IssuanceError::EntitlementRequired => StatusCode::FORBIDDEN,
            IssuanceError::EntitlementLookupFailed | IssuanceError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for IssuanceError {
    fn into_response(self) -> Response {
        if let IssuanceError::Unexpected(source) = &self {
            tracing::error!(error = ?source, "download token issuance failed");
        }
        error_response(self.status(), self.to_string())
    }
}

/// A signed token ready to hand to the client.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claim: DownloadClaim,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    pub product: Product,
}

impl IssuedToken {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.claim.expires_at_utc()
    }
}

#[derive(Clone)]
pub struct IssuanceService {
    codec: TokenCodec,
    catalog: Arc<dyn Catalog>,
    entitlements: Arc<dyn EntitlementOracle>,
    audit: Arc<dyn AuditLog>,
}

impl IssuanceService {
    pub fn new(
        codec: TokenCodec,
        catalog: Arc<dyn Catalog>,
        entitlements: Arc<dyn EntitlementOracle>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            codec,
            catalog,
            entitlements,
            audit,
        }
    }

    /// Issues a download token for `resource_id` to an already
    /// authenticated `subject_id`.
    pub async fn issue(
        &self,
        subject_id: &str,
        resource_id: &str,
    ) -> Result<IssuedToken, IssuanceError> {
        self.issue_at(subject_id, resource_id, unix_now()).await
    }

    #[tracing::instrument(skip(self))]
    pub(crate) async fn issue_at(
        &self,
        subject_id: &str,
        resource_id: &str,
        now: u64,
    ) -> Result<IssuedToken, IssuanceError> {
        let product = self
            .catalog
            .find_product(resource_id)
            .await
            .map_err(IssuanceError::Unexpected)?
            .filter(|product| product.is_active)
            .ok_or(IssuanceError::ResourceNotFound)?;

        let entitled = self
            .entitlements
            .has_active_entitlement(subject_id)
            .await
            .map_err(IssuanceError::Unexpected)?;
        if !entitled {
            tracing::info!(audit = true, subject = %subject_id, "download refused, no active subscription");
            return Err(IssuanceError::EntitlementRequired);
        }

        let record = match self.entitlements.active_entitlement(subject_id).await {
            Ok(Some(record)) => {
                tracing::debug!(plan = ?record.plan, expires_at = ?record.expires_at, "subscription record found");
                record
            }
            Ok(None) => {
                tracing::error!(subject = %subject_id, "entitlement check passed but no subscription record found");
                return Err(IssuanceError::EntitlementLookupFailed);
            }
            Err(e) => {
                tracing::error!(subject = %subject_id, error = ?e, "subscription record lookup failed");
                return Err(IssuanceError::EntitlementLookupFailed);
            }
        };

        let grant = Grant {
            subject_id: subject_id.to_string(),
            resource_id: product.id.clone(),
            entitlement_id: record.id,
        };
        let signed = self
            .codec
            .encode_at(&grant, now)
            .map_err(|e| IssuanceError::Unexpected(e.into()))?;

        audit::record(
            self.audit.clone(),
            AuditEvent {
                action: AuditAction::Issued,
                subject_id: grant.subject_id.clone(),
                resource_id: grant.resource_id.clone(),
                entitlement_id: grant.entitlement_id.clone(),
                occurred_at: DateTime::from_timestamp(now as i64, 0).unwrap_or_else(Utc::now),
                expires_at: Some(signed.claim.expires_at_utc()),
                token_fingerprint: None,
            },
        );

        crate::audit!(
            subject = %subject_id,
            resource = %grant.resource_id,
            entitlement = %grant.entitlement_id,
            expires_at = signed.claim.expires_at,
            "Issued download token"
        );

        Ok(IssuedToken {
            token: signed.token,
            claim: signed.claim,
            expires_in: self.codec.ttl().as_secs(),
            product,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceRequest {
    resource_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub id: String,
    pub title: String,
    pub author: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceResponse {
    pub success: bool,
    pub download_token: String,
    pub expires_in: u64,
    pub expires_at: String,
    pub resource: ResourceSummary,
}

/// Handler for `POST /issuance`.
///
/// 1.  Resolves the caller from the session token.
/// 2.  Reads `resourceId` from the JSON body.
/// 3.  Checks the product and the caller's subscription, then signs a token.
#[tracing::instrument(skip_all)]
pub async fn issue_download_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<IssuanceRequest>, JsonRejection>,
) -> Result<Json<IssuanceResponse>, IssuanceError> {
    let identity = state
        .sessions
        .identify(&headers)
        .await
        .map_err(|_| IssuanceError::Unauthenticated)?;

    let resource_id = payload
        .ok()
        .and_then(|Json(body)| body.resource_id)
        .filter(|id| !id.trim().is_empty())
        .ok_or(IssuanceError::MissingResourceId)?;

    let issued = state.issuance.issue(&identity.sub, &resource_id).await?;

    Ok(Json(IssuanceResponse {
        success: true,
        expires_in: issued.expires_in,
        expires_at: issued.expires_at().to_rfc3339(),
        download_token: issued.token,
        resource: ResourceSummary {
            id: issued.product.id,
            title: issued.product.title,
            author: issued.product.author,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodeError;
    use crate::testing::{self, Fixture, RecordingAudit};
    use axum::body::to_bytes;
    use serde_json::json;
    use std::time::{Duration, Instant};

    const NOW: u64 = 1_700_000_000;

    #[tokio::test]
    async fn test_issue_binds_subject_resource_and_entitlement() {
        let fx = Fixture::new();
        let issued = fx.issuance().issue_at("U1", "P1", NOW).await.unwrap();

        let claim = fx.codec().decode_at(&issued.token, NOW + 1).unwrap();
        assert_eq!(claim.subject_id, "U1");
        assert_eq!(claim.resource_id, "P1");
        assert_eq!(claim.entitlement_id, "sub-U1");
        assert_eq!(claim.expires_at - claim.issued_at, 900);
        assert_eq!(issued.expires_in, 900);
        assert_eq!(issued.product.title, "Dune");
    }

    #[tokio::test]
    async fn test_issue_records_audit_entry() {
        let fx = Fixture::new();
        fx.issuance().issue_at("U1", "P1", NOW).await.unwrap();

        let events = fx.audit.wait_for_events(1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::Issued);
        assert_eq!(events[0].entitlement_id, "sub-U1");
        assert_eq!(
            events[0].expires_at.map(|t| t.timestamp()),
            Some((NOW + 900) as i64)
        );
        assert_eq!(events[0].token_fingerprint, None);
    }

    #[tokio::test]
    async fn test_issue_without_entitlement_is_refused() {
        let fx = Fixture::new();
        let result = fx.issuance().issue_at("U2", "P1", NOW).await;

        assert!(matches!(result, Err(IssuanceError::EntitlementRequired)));
        assert!(fx.audit.events().is_empty());
    }

    #[tokio::test]
    async fn test_issue_for_unknown_or_inactive_product() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.issuance().issue_at("U1", "missing", NOW).await,
            Err(IssuanceError::ResourceNotFound)
        ));
        assert!(matches!(
            fx.issuance().issue_at("U1", "retired", NOW).await,
            Err(IssuanceError::ResourceNotFound)
        ));
    }

    #[tokio::test]
    async fn test_issue_with_inconsistent_entitlement_record() {
        let fx = Fixture::new();
        fx.entitlements.drop_record("U1");

        assert!(matches!(
            fx.issuance().issue_at("U1", "P1", NOW).await,
            Err(IssuanceError::EntitlementLookupFailed)
        ));
    }

    #[tokio::test]
    async fn test_issue_when_oracle_is_down() {
        let fx = Fixture::new();
        fx.entitlements.fail_checks();

        let err = fx.issuance().issue_at("U1", "P1", NOW).await.unwrap_err();
        assert!(matches!(err, IssuanceError::Unexpected(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_issuance() {
        let fx = Fixture::with_failing_audit();
        let issued = fx.issuance().issue_at("U1", "P1", NOW).await.unwrap();
        assert!(fx.codec().decode_at(&issued.token, NOW + 1).is_ok());
    }

    #[tokio::test]
    async fn test_slow_audit_store_does_not_delay_issuance() {
        let fx = Fixture::with_audit(RecordingAudit::slow(Duration::from_secs(2)));

        let started = Instant::now();
        let issued = fx.issuance().issue_at("U1", "P1", NOW).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(fx.codec().decode_at(&issued.token, NOW + 1).is_ok());
        assert!(fx.audit.events().is_empty());

        let events = fx.audit.wait_for_events(1).await;
        assert_eq!(events[0].action, AuditAction::Issued);
    }

    #[tokio::test]
    async fn test_tokens_from_other_secrets_do_not_verify() {
        let fx = Fixture::new();
        let issued = fx.issuance().issue_at("U1", "P1", NOW).await.unwrap();
        let other = crate::codec::TokenCodec::new(b"other", std::time::Duration::from_secs(900));
        assert_eq!(
            other.decode_at(&issued.token, NOW + 1),
            Err(DecodeError::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn test_handler_success() {
        let fx = Fixture::new();
        let state = fx.app_state();

        let response = issue_download_token(
            State(state),
            testing::bearer_headers("U1"),
            Ok(Json(IssuanceRequest {
                resource_id: Some("P1".to_string()),
            })),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(body["success"], json!(true));
        assert_eq!(body["expiresIn"], json!(900));
        assert_eq!(body["resource"]["id"], json!("P1"));
        assert_eq!(body["resource"]["author"], json!("Frank Herbert"));
        assert!(DateTime::parse_from_rfc3339(body["expiresAt"].as_str().unwrap()).is_ok());

        let token = body["downloadToken"].as_str().unwrap();
        let claim = fx.codec().decode_at(token, unix_now()).unwrap();
        assert_eq!(claim.subject_id, "U1");
        assert_eq!(claim.resource_id, "P1");
    }

    #[tokio::test]
    async fn test_handler_requires_session() {
        let fx = Fixture::new();
        let response = issue_download_token(
            State(fx.app_state()),
            HeaderMap::new(),
            Ok(Json(IssuanceRequest {
                resource_id: Some("P1".to_string()),
            })),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_handler_requires_resource_id() {
        let fx = Fixture::new();
        for resource_id in [None, Some("  ".to_string())] {
            let response = issue_download_token(
                State(fx.app_state()),
                testing::bearer_headers("U1"),
                Ok(Json(IssuanceRequest { resource_id })),
            )
            .await
            .into_response();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["success"], json!(false));
            assert_eq!(body["error"], json!("resourceId is required"));
        }
    }

    #[tokio::test]
    async fn test_handler_maps_missing_entitlement_to_forbidden() {
        let fx = Fixture::new();
        let response = issue_download_token(
            State(fx.app_state()),
            testing::bearer_headers("U2"),
            Ok(Json(IssuanceRequest {
                resource_id: Some("P1".to_string()),
            })),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body.get("downloadToken").is_none());
    }
}
