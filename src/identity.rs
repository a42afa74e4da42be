//! Caller identity. API requests carry `Authorization: Bearer <token>`, an
//! HS256 compact JWS whose `sub` claim is the identity provider's user id.
//! The session middleware verifies it and stores the subject in the request
//! extensions; operations then resolve the subject to a local [`User`].

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::error::ApiError;
use crate::model::User;
use crate::state::AppState;
use crate::store::StoreTx;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported algorithm")]
    Algorithm,
    #[error("bad signature")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("missing subject")]
    Subject,
    #[error("unusable signing key")]
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    /// Expiry, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

#[derive(Deserialize)]
struct TokenHeader {
    alg: String,
}

/// Verified identity subject (set by [`require_session`]). Newtype so the
/// extension is uniquely keyed.
#[derive(Clone, Debug)]
pub struct VerifiedSubject(pub String);

impl std::ops::Deref for VerifiedSubject {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

#[derive(Clone)]
pub struct SessionVerifier {
    key: Vec<u8>,
}

impl SessionVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.key).map_err(|_| TokenError::Key)
    }

    /// Sign claims into a token. Used by tests and local tooling; production
    /// tokens come from the identity provider's session template.
    pub fn issue(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = serde_json::to_vec(claims).map_err(|_| TokenError::Malformed)?;
        let signing_input = format!("{}.{}", header, URL_SAFE_NO_PAD.encode(claims));
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", signing_input, sig))
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let mut parts = token.trim().split('.');
        let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| TokenError::Malformed)?;
        let header: TokenHeader =
            serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
        if header.alg != "HS256" {
            return Err(TokenError::Algorithm);
        }

        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&sig).map_err(|_| TokenError::Signature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if claims.sub.trim().is_empty() {
            return Err(TokenError::Subject);
        }
        if let Some(exp) = claims.exp {
            if exp <= Utc::now().timestamp() {
                return Err(TokenError::Expired);
            }
        }
        Ok(claims)
    }
}

/// Middleware for `/api/*`: rejects the request with 401 unless it carries a
/// valid session token, otherwise inserts [`VerifiedSubject`].
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError::Unauthorized.into_response();
    };

    match state.sessions.verify(token) {
        Ok(claims) => {
            request.extensions_mut().insert(VerifiedSubject(claims.sub));
            next.run(request).await
        }
        Err(e) => {
            warn!("Rejected session token: {}", e);
            ApiError::Unauthorized.into_response()
        }
    }
}

/// Map a verified subject to its local user. A verified subject without a
/// local record means the provisioning webhook has not landed yet.
pub async fn resolve_caller(tx: &mut dyn StoreTx, subject: &str) -> Result<User, ApiError> {
    tx.user_by_clerk_id(subject)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str, exp: Option<i64>) -> SessionClaims {
        SessionClaims {
            sub: sub.to_string(),
            exp,
        }
    }

    #[test]
    fn issued_token_verifies() {
        let v = SessionVerifier::new("secret");
        let token = v.issue(&claims("user_abc", None)).unwrap();
        assert_eq!(v.verify(&token).unwrap().sub, "user_abc");
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let token = SessionVerifier::new("other").issue(&claims("user_abc", None)).unwrap();
        let err = SessionVerifier::new("secret").verify(&token).unwrap_err();
        assert_eq!(err, TokenError::Signature);
    }

    #[test]
    fn expired_token_is_rejected() {
        let v = SessionVerifier::new("secret");
        let past = Utc::now().timestamp() - 10;
        let token = v.issue(&claims("user_abc", Some(past))).unwrap();
        assert_eq!(v.verify(&token).unwrap_err(), TokenError::Expired);

        let future = Utc::now().timestamp() + 600;
        let token = v.issue(&claims("user_abc", Some(future))).unwrap();
        assert!(v.verify(&token).is_ok());
    }

    #[test]
    fn garbage_is_malformed() {
        let v = SessionVerifier::new("secret");
        assert_eq!(v.verify("not-a-token").unwrap_err(), TokenError::Malformed);
        assert_eq!(v.verify("a.b.c.d").unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let v = SessionVerifier::new("secret");
        let token = v.issue(&claims("user_abc", None)).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":"user_admin"}"#);
        parts[1] = &forged;
        assert_eq!(v.verify(&parts.join(".")).unwrap_err(), TokenError::Signature);
    }

    #[test]
    fn other_algorithms_are_rejected() {
        let v = SessionVerifier::new("secret");
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"user_abc"}"#);
        let token = format!("{}.{}.", header, payload);
        assert_eq!(v.verify(&token).unwrap_err(), TokenError::Algorithm);
    }
}
