//! Signed side-channel telling the backend which fields were rewritten.
//!
//! The backend verifies the token with the shared secret and resolves
//! the rewritten fields from it instead of trusting anything in the
//! multipart body itself.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use super::error::ProcessingError;

/// Header carrying the signed [`MultipartClaims`] on a rewritten request.
pub const REWRITTEN_FIELDS_HEADER: &str = "Gatehouse-Multipart-Fields";

pub const CLAIM_ISSUER: &str = "gatehouse";

/// Original file-field name to the reference of the stored file.
pub type RewrittenFieldMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartClaims {
    pub rewritten_fields: RewrittenFieldMap,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct TrustClaimEncoder {
    key: EncodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for TrustClaimEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustClaimEncoder")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TrustClaimEncoder {
    pub const MIN_SECRET_LEN: usize = 32;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            ttl,
        }
    }

    #[must_use]
    pub fn claims(&self, fields: &RewrittenFieldMap, now: DateTime<Utc>) -> MultipartClaims {
        let iat = now.timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        MultipartClaims {
            rewritten_fields: fields.clone(),
            iss: CLAIM_ISSUER.to_string(),
            iat,
            exp: iat.saturating_add(ttl),
        }
    }

    pub fn encode(&self, fields: &RewrittenFieldMap) -> Result<String, ProcessingError> {
        let claims = self.claims(fields, Utc::now());
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| ProcessingError::unknown("sign rewritten fields", e))
    }
}
