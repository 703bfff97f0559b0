//! # Session Token Verification
//!
//! The edge relay terminates TLS and issues session tokens; the pod only
//! re-checks the HMAC-SHA256 signature against the shared secret and
//! extracts the identity. Token format:
//! `base64url(json claims) . base64url(hmac_sha256(key, base64url(claims)))`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Token verification failures. All of them surface as `Unauthorized`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Token is not two dot-separated base64url parts with JSON claims.
    #[error("malformed token")]
    Malformed,

    /// HMAC signature does not match.
    #[error("bad signature")]
    BadSignature,

    /// Token expiry is in the past.
    #[error("token expired")]
    Expired,

    /// Token was issued for a different room.
    #[error("token room mismatch")]
    RoomMismatch,
}

/// Claims the edge embeds in a session token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    /// Authenticated user id.
    #[serde(rename = "uid")]
    pub user_id: String,

    /// Room the session was admitted to.
    #[serde(rename = "rid")]
    pub room_id: String,

    /// Expiry, epoch seconds.
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

/// Verifies edge-issued session tokens against the shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: Vec<u8>,
}

impl TokenVerifier {
    /// Verifier over the shared `EDGE_TOKEN_SECRET`.
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    /// Re-check a token's signature and expiry, and confirm it was issued
    /// for `room_id`. Returns the embedded claims on success.
    pub fn verify(
        &self,
        token: &str,
        room_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenClaims, AuthError> {
        let (claims_b64, sig_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;
        if claims_b64.contains('.') || sig_b64.contains('.') {
            return Err(AuthError::Malformed);
        }
        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| AuthError::BadSignature)?;
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims_raw = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| AuthError::Malformed)?;
        let claims: TokenClaims =
            serde_json::from_slice(&claims_raw).map_err(|_| AuthError::Malformed)?;

        if claims.expires_at <= now.timestamp() {
            return Err(AuthError::Expired);
        }
        if claims.room_id != room_id {
            return Err(AuthError::RoomMismatch);
        }
        Ok(claims)
    }

    /// Sign claims into a token. The edge owns issuance in production; the
    /// pod exposes this for tests and local tooling.
    pub fn sign(&self, claims: &TokenClaims) -> String {
        let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims encode"));
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac key");
        mac.update(claims_b64.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{claims_b64}.{sig_b64}")
    }
}
