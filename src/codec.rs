//! Download token encoding and verification.
//!
//! Tokens are compact HS256 JWTs. The purpose (`iss`) and audience (`aud`)
//! labels are signed along with the claim so a token minted for another use
//! of the same secret is rejected here.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::claims::{DownloadClaim, Grant, generate_token_id};
use crate::config::Settings;

pub const TOKEN_PURPOSE: &str = "download-service";
pub const TOKEN_AUDIENCE: &str = "ebook-download";

/// Number of digest bytes kept in a token fingerprint.
const FINGERPRINT_BYTES: usize = 12;

/// Why a token failed to decode. The variants are never merged: clients
/// re-request an expired link but report a broken one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("download token has expired")]
    Expired,
    #[error("download token signature is invalid")]
    InvalidSignature,
    #[error("download token is malformed")]
    Malformed,
}

/// JWT body as it travels on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct WireClaims {
    sub: String,
    rid: String,
    eid: String,
    jti: String,
    iss: String,
    aud: String,
    iat: u64,
    exp: u64,
}

/// A freshly signed token together with the claim it carries.
#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub claim: DownloadClaim,
}

/// Signs and verifies download tokens with a single shared secret.
///
/// Holds no mutable state; clones share nothing but the key material.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenCodec {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against an explicit clock in `decode_at`.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_issuer(&[TOKEN_PURPOSE]);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.signing_secret.as_bytes(), settings.token_ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Signs `grant` as if issued at `now` (UNIX seconds).
    pub fn encode_at(
        &self,
        grant: &Grant,
        now: u64,
    ) -> Result<SignedToken, jsonwebtoken::errors::Error> {
        let claim = DownloadClaim {
            subject_id: grant.subject_id.clone(),
            resource_id: grant.resource_id.clone(),
            entitlement_id: grant.entitlement_id.clone(),
            token_id: generate_token_id(),
            issued_at: now,
            expires_at: now.saturating_add(self.ttl.as_secs()),
        };
        let wire = WireClaims {
            sub: claim.subject_id.clone(),
            rid: claim.resource_id.clone(),
            eid: claim.entitlement_id.clone(),
            jti: claim.token_id.clone(),
            iss: TOKEN_PURPOSE.to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
            iat: claim.issued_at,
            exp: claim.expires_at,
        };

        let token = encode(&Header::new(Algorithm::HS256), &wire, &self.encoding_key)?;
        Ok(SignedToken { token, claim })
    }

    /// Verifies `token` and checks it is still live at `now` (UNIX seconds).
    pub fn decode_at(&self, token: &str, now: u64) -> Result<DownloadClaim, DecodeError> {
        let data = decode::<WireClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            let kind = classify(&e);
            tracing::debug!(error = %e, ?kind, "download token rejected");
            kind
        })?;
        let wire = data.claims;

        if now >= wire.exp {
            return Err(DecodeError::Expired);
        }

        Ok(DownloadClaim {
            subject_id: wire.sub,
            resource_id: wire.rid,
            entitlement_id: wire.eid,
            token_id: wire.jti,
            issued_at: wire.iat,
            expires_at: wire.exp,
        })
    }
}

fn classify(err: &jsonwebtoken::errors::Error) -> DecodeError {
    match err.kind() {
        ErrorKind::ExpiredSignature => DecodeError::Expired,
        // A genuine signature over the wrong purpose is as unusable here as a forged one.
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience => DecodeError::InvalidSignature,
        _ => DecodeError::Malformed,
    }
}

/// Short, non-reversible identifier of a token for logs and audit rows.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..FINGERPRINT_BYTES])
}
