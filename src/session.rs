//! Caller identity from the identity provider's session token.
//!
//! The storefront's identity provider signs session tokens with an RSA key
//! published at its JWKS endpoint. The key set is fetched on demand and
//! cached for an hour.

use axum::http::{HeaderMap, header};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::IdentityConfig;

/// A JSON Web Key Set.
#[derive(Clone, Serialize, Deserialize)]
pub struct Jwks {
    /// List of keys.
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Modulus and exponent of the RSA key published under `kid`.
    ///
    /// Providers may publish other key types alongside; those are skipped.
    pub fn rsa_components(&self, kid: &str) -> Option<(&str, &str)> {
        self.keys
            .iter()
            .filter(|k| k.kty == "RSA" && k.kid.as_deref() == Some(kid))
            .find_map(|k| Some((k.n.as_deref()?, k.e.as_deref()?)))
    }
}

/// A JSON Web Key. Only the RSA members are read.
#[derive(Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA").
    pub kty: String,
    /// Key ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Modulus (Base64URL encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// Exponent (Base64URL encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

/// Claims read from the session token.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionIdentity {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing bearer session token")]
    Missing,
    #[error("invalid session token: {0}")]
    Invalid(#[source] anyhow::Error),
}

#[derive(Clone)]
pub struct SessionVerifier {
    config: IdentityConfig,
    client: reqwest::Client,
    jwks_cache: Cache<String, Jwks>,
}

impl SessionVerifier {
    pub fn new(config: IdentityConfig, client: reqwest::Client) -> Self {
        let jwks_cache = Cache::builder()
            .time_to_live(Duration::from_secs(3600))
            .build();
        Self {
            config,
            client,
            jwks_cache,
        }
    }

    /// Resolves the authenticated caller from the `Authorization` header.
    #[tracing::instrument(skip(self, headers))]
    pub async fn identify(&self, headers: &HeaderMap) -> Result<SessionIdentity, SessionError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                tracing::debug!("No bearer session token found");
                SessionError::Missing
            })?;

        let identity = if self.config.validate_token {
            self.decode_with_validation(token).await
        } else {
            tracing::debug!("Decoding session token without signature validation");
            decode_without_validation(token)
        }
        .map_err(|e| {
            tracing::warn!("Rejected session token: {}", e);
            SessionError::Invalid(e)
        })?;

        tracing::debug!(subject = %identity.sub, email = ?identity.email, "resolved session identity");
        Ok(identity)
    }

    async fn decode_with_validation(&self, token: &str) -> anyhow::Result<SessionIdentity> {
        let header = decode_header(token)?;
        if !matches!(
            header.alg,
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512
        ) {
            anyhow::bail!("unsupported session token algorithm {:?}", header.alg);
        }
        let kid = header.kid.ok_or_else(|| anyhow::anyhow!("Missing kid"))?;

        let jwks_url = self.config.jwks_url.clone();
        let client = self.client.clone();
        let jwks = self
            .jwks_cache
            .try_get_with(jwks_url.clone(), async move {
                let jwks: Jwks = client
                    .get(&jwks_url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok::<_, anyhow::Error>(jwks)
            })
            .await
            .map_err(|e: Arc<anyhow::Error>| anyhow::anyhow!("Failed to fetch or cache JWKS: {}", e))?;

        let (n, e) = jwks
            .rsa_components(&kid)
            .ok_or_else(|| anyhow::anyhow!("JWK not found"))?;

        let decoding_key = DecodingKey::from_rsa_components(n, e)?;
        let mut validation = Validation::new(header.alg);
        match &self.config.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        let decoded = decode::<SessionIdentity>(token, &decoding_key, &validation)?;

        Ok(decoded.claims)
    }
}

fn decode_without_validation(token: &str) -> anyhow::Result<SessionIdentity> {
    let decoded = jsonwebtoken::dangerous::insecure_decode::<SessionIdentity>(token)?;
    Ok(decoded.claims)
}
