//! Logic for the `/redemption/{resourceId}` endpoint.
//!
//! Second half of the download handshake. The token is re-verified against
//! the caller and the requested product, and the subscription is checked
//! again: it may have lapsed since the token was issued.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::audit::{self, AuditAction, AuditEvent, AuditLog};
use crate::catalog::Catalog;
use crate::claims::unix_now;
use crate::codec::{DecodeError, TokenCodec, fingerprint};
use crate::entitlement::EntitlementOracle;
use crate::error::error_response;
use crate::replay::RedeemedTokens;
use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum RedemptionError {
    #[error("Authentication required")]
    Unauthenticated,
    #[error("Download token is required")]
    MissingToken,
    #[error("Invalid download token")]
    InvalidToken,
    #[error("Download link has expired, please request a new one")]
    TokenExpired,
    #[error("Download token is not valid for this product")]
    ResourceMismatch,
    #[error("Download token was issued to a different user")]
    IdentityMismatch,
    #[error("Your subscription is no longer active")]
    EntitlementExpired,
    #[error("Ebook file is not available")]
    ResourceUnavailable,
    #[error("Download link has already been used")]
    AlreadyRedeemed,
    #[error("Failed to download ebook")]
    Unexpected(#[source] anyhow::Error),
}

impl RedemptionError {
    pub fn status(&self) -> StatusCode {
        match self {
            RedemptionError::MissingToken => StatusCode::BAD_REQUEST,
            RedemptionError::Unauthenticated
            | RedemptionError::InvalidToken
            | RedemptionError::TokenExpired
            | RedemptionError::IdentityMismatch => StatusCode::UNAUTHORIZED,
            // Forbidden rather than not-found so product ids cannot be probed.
            RedemptionError::ResourceMismatch | RedemptionError::EntitlementExpired => {
                StatusCode::FORBIDDEN
            }
            RedemptionError::ResourceUnavailable => StatusCode::NOT_FOUND,
            RedemptionError::AlreadyRedeemed => StatusCode::GONE,
            RedemptionError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DecodeError> for RedemptionError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Expired => RedemptionError::TokenExpired,
            DecodeError::InvalidSignature | DecodeError::Malformed => RedemptionError::InvalidToken,
        }
    }
}

impl IntoResponse for RedemptionError {
    fn into_response(self) -> Response {
        match &self {
            RedemptionError::Unexpected(source) => {
                tracing::error!(error = ?source, "download token redemption failed")
            }
            other => tracing::info!(audit = true, reason = %other, "download token rejected"),
        }
        error_response(self.status(), self.to_string())
    }
}

/// Permission to transfer one file to one caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedDownload {
    pub subject_id: String,
    pub resource_id: String,
    pub file_url: String,
    /// Suggested `Content-Disposition` filename.
    pub filename: String,
    pub content_type: &'static str,
}

#[derive(Clone)]
pub struct RedemptionService {
    codec: TokenCodec,
    catalog: Arc<dyn Catalog>,
    entitlements: Arc<dyn EntitlementOracle>,
    audit: Arc<dyn AuditLog>,
    /// Present only when single-use tokens are enforced.
    redeemed: Option<RedeemedTokens>,
}

impl RedemptionService {
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
            redeemed: None,
        }
    }

    /// Rejects any token presented a second time within its lifetime.
    pub fn with_single_use(mut self) -> Self {
        self.redeemed = Some(RedeemedTokens::new(self.codec.ttl()));
        self
    }

    pub async fn redeem(
        &self,
        token: &str,
        expected_resource_id: &str,
        caller_subject_id: &str,
    ) -> Result<AuthorizedDownload, RedemptionError> {
        self.redeem_at(token, expected_resource_id, caller_subject_id, unix_now())
            .await
    }

    #[tracing::instrument(skip(self, token), fields(token = %fingerprint(token)))]
    pub(crate) async fn redeem_at(
        &self,
        token: &str,
        expected_resource_id: &str,
        caller_subject_id: &str,
        now: u64,
    ) -> Result<AuthorizedDownload, RedemptionError> {
        if token.is_empty() {
            return Err(RedemptionError::MissingToken);
        }

        let claim = self.codec.decode_at(token, now)?;

        if claim.resource_id != expected_resource_id {
            return Err(RedemptionError::ResourceMismatch);
        }
        if claim.subject_id != caller_subject_id {
            return Err(RedemptionError::IdentityMismatch);
        }

        // Always asked afresh: the subscription may have ended since issuance.
        let entitled = self
            .entitlements
            .has_active_entitlement(caller_subject_id)
            .await
            .map_err(RedemptionError::Unexpected)?;
        if !entitled {
            return Err(RedemptionError::EntitlementExpired);
        }

        let product = self
            .catalog
            .find_product(&claim.resource_id)
            .await
            .map_err(RedemptionError::Unexpected)?
            .filter(|product| product.is_active)
            .ok_or(RedemptionError::ResourceUnavailable)?;
        let file_url = product
            .file_url
            .clone()
            .filter(|url| !url.is_empty())
            .ok_or(RedemptionError::ResourceUnavailable)?;

        let token_fingerprint = fingerprint(token);
        if let Some(redeemed) = &self.redeemed {
            if !redeemed.mark(&token_fingerprint).await {
                return Err(RedemptionError::AlreadyRedeemed);
            }
        }

        audit::record(
            self.audit.clone(),
            AuditEvent {
                action: AuditAction::Redeemed,
                subject_id: claim.subject_id.clone(),
                resource_id: claim.resource_id.clone(),
                entitlement_id: claim.entitlement_id.clone(),
                occurred_at: DateTime::from_timestamp(now as i64, 0).unwrap_or_else(Utc::now),
                expires_at: None,
                token_fingerprint: Some(token_fingerprint.clone()),
            },
        );

        crate::audit!(
            subject = %claim.subject_id,
            resource = %claim.resource_id,
            entitlement = %claim.entitlement_id,
            token = %token_fingerprint,
            remaining_secs = claim.remaining_secs(now),
            "Redeemed download token"
        );

        Ok(AuthorizedDownload {
            subject_id: claim.subject_id,
            resource_id: claim.resource_id,
            file_url,
            filename: product.download_filename(),
            content_type: product.content_type(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRequest {
    download_token: Option<String>,
}

/// Handler for `POST /redemption/{resourceId}`.
///
/// Responds with the ebook itself once the token checks out.
#[tracing::instrument(skip_all, fields(resource = %resource_id))]
pub async fn redeem_download_token(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<RedemptionRequest>, JsonRejection>,
) -> Result<Response, RedemptionError> {
    let identity = state
        .sessions
        .identify(&headers)
        .await
        .map_err(|_| RedemptionError::Unauthenticated)?;

    let token = payload
        .ok()
        .and_then(|Json(body)| body.download_token)
        .filter(|token| !token.is_empty())
        .ok_or(RedemptionError::MissingToken)?;

    let download = state
        .redemption
        .redeem(&token, &resource_id, &identity.sub)
        .await?;

    state
        .delivery
        .deliver(&download)
        .await
        .map_err(RedemptionError::Unexpected)
}

/// Handler for `GET /redemption/{resourceId}`.
///
/// Redemption must be a deliberate POST so link prefetchers and crawlers
/// cannot trigger it.
pub async fn redemption_method_not_allowed() -> Response {
    let mut response = error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "Use POST with a download token to download this ebook",
    );
    response
        .headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static("POST"));
    response
}
