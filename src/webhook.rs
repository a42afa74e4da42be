//! Identity provider webhook ingestion.
//!
//! Deliveries are signed svix-style: the signed content is
//! `"{svix-id}.{svix-timestamp}.{body}"`, the signature is base64 HMAC-SHA256
//! with the decoded `whsec_` key, and the `svix-signature` header carries one or
//! more space-separated `v1,<base64>` entries.

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{error, info, warn};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::error::{ApiError, ApiResult};
use crate::model::UserProfile;
use crate::ops::users;
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

const SECRET_PREFIX: &str = "whsec_";
/// Accepted clock skew between the sender and us, in seconds.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 5 * 60;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook secret is not configured")]
    NoSecret,
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("invalid timestamp")]
    Timestamp,
    #[error("timestamp outside tolerance")]
    Stale,
    #[error("no matching signature")]
    Signature,
    #[error("unparsable payload: {0}")]
    Payload(String),
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        ApiError::VerificationFailed(e.to_string())
    }
}

#[derive(Clone)]
pub struct WebhookVerifier {
    key: Option<Vec<u8>>,
}

impl WebhookVerifier {
    /// An empty or undecodable secret yields a verifier that rejects everything.
    pub fn new(secret: &str) -> Self {
        let secret = secret.trim();
        let encoded = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
        let key = if encoded.is_empty() {
            None
        } else {
            match STANDARD.decode(encoded) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Webhook secret is not valid base64: {}", e);
                    None
                }
            }
        };
        Self { key }
    }

    fn mac(&self, id: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, WebhookError> {
        let key = self.key.as_deref().ok_or(WebhookError::NoSecret)?;
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| WebhookError::NoSecret)?;
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    /// Signature header value for a delivery (`v1,<base64>`).
    pub fn sign(&self, id: &str, timestamp: i64, body: &[u8]) -> Result<String, WebhookError> {
        let mac = self.mac(id, &timestamp.to_string(), body)?;
        Ok(format!("v1,{}", STANDARD.encode(mac.finalize().into_bytes())))
    }

    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
        self.verify_at(headers, body, Utc::now().timestamp())
    }

    pub fn verify_at(&self, headers: &HeaderMap, body: &[u8], now: i64) -> Result<(), WebhookError> {
        let id = header(headers, "svix-id")?;
        let timestamp = header(headers, "svix-timestamp")?;
        let signatures = header(headers, "svix-signature")?;

        let ts: i64 = timestamp.trim().parse().map_err(|_| WebhookError::Timestamp)?;
        if (now - ts).abs() > TIMESTAMP_TOLERANCE_SECS {
            return Err(WebhookError::Stale);
        }

        for entry in signatures.split_whitespace() {
            let Some(("v1", sig_b64)) = entry.split_once(',') else {
                continue;
            };
            let Ok(sig) = STANDARD.decode(sig_b64) else {
                continue;
            };
            if self.mac(id, timestamp, body)?.verify_slice(&sig).is_ok() {
                return Ok(());
            }
        }
        Err(WebhookError::Signature)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::MissingHeader(name))
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAddress {
    pub id: String,
    pub email_address: String,
}

/// The `data` object of a `user.*` event. Only the fields we store.
#[derive(Debug, Clone, Deserialize)]
pub struct ClerkUserData {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub email_addresses: Vec<EmailAddress>,
    #[serde(default)]
    pub primary_email_address_id: Option<String>,
}

impl ClerkUserData {
    pub fn to_profile(&self) -> UserProfile {
        let username = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        )
        .trim()
        .to_string();

        let primary = self.primary_email_address_id.as_deref().and_then(|pid| {
            self.email_addresses.iter().find(|e| e.id == pid)
        });
        let email = primary
            .or_else(|| self.email_addresses.first())
            .map(|e| e.email_address.clone())
            .unwrap_or_default();

        UserProfile {
            username,
            image_url: self.image_url.clone().unwrap_or_default(),
            clerk_id: self.id.clone(),
            email,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    UserCreated(ClerkUserData),
    UserUpdated(ClerkUserData),
    Other(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        let envelope: Envelope =
            serde_json::from_slice(body).map_err(|e| WebhookError::Payload(e.to_string()))?;
        let user = |data: serde_json::Value| {
            serde_json::from_value::<ClerkUserData>(data)
                .map_err(|e| WebhookError::Payload(e.to_string()))
        };
        match envelope.kind.as_str() {
            "user.created" => Ok(WebhookEvent::UserCreated(user(envelope.data)?)),
            "user.updated" => Ok(WebhookEvent::UserUpdated(user(envelope.data)?)),
            _ => Ok(WebhookEvent::Other(envelope.kind)),
        }
    }
}

/// Outcome of a verified delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Processed,
    Ignored,
}

/// Apply a verified event. Created and updated both go through the same
/// upsert, so redelivery and out-of-order delivery converge.
pub async fn ingest(store: &Store, event: WebhookEvent) -> ApiResult<Ingested> {
    match event {
        WebhookEvent::UserCreated(data) | WebhookEvent::UserUpdated(data) => {
            let profile = data.to_profile();
            users::upsert_by_external_id(store, &profile)
                .await
                .map_err(|e| {
                    error!("Failed to upsert user {}: {}", profile.clerk_id, e);
                    ApiError::DownstreamWriteFailed(profile.clerk_id.clone())
                })?;
            Ok(Ingested::Processed)
        }
        WebhookEvent::Other(kind) => {
            info!("Ignoring webhook event {}", kind);
            Ok(Ingested::Ignored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

    fn headers(id: &str, ts: i64, sig: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("svix-id", HeaderValue::from_str(id).unwrap());
        h.insert("svix-timestamp", HeaderValue::from_str(&ts.to_string()).unwrap());
        h.insert("svix-signature", HeaderValue::from_str(sig).unwrap());
        h
    }

    #[test]
    fn accepts_own_signature() {
        let v = WebhookVerifier::new(SECRET);
        let body = br#"{"type":"user.created"}"#;
        let sig = v.sign("msg_1", 1_700_000_000, body).unwrap();
        assert!(v.verify_at(&headers("msg_1", 1_700_000_000, &sig), body, 1_700_000_010).is_ok());
    }

    #[test]
    fn any_listed_signature_may_match() {
        let v = WebhookVerifier::new(SECRET);
        let body = b"{}";
        let good = v.sign("msg_1", 100, body).unwrap();
        let list = format!("v1,AAAA v2,zzzz {}", good);
        assert!(v.verify_at(&headers("msg_1", 100, &list), body, 100).is_ok());
    }

    #[test]
    fn rejects_tampering_and_staleness() {
        let v = WebhookVerifier::new(SECRET);
        let body = b"{}";
        let sig = v.sign("msg_1", 100, body).unwrap();

        assert_eq!(
            v.verify_at(&headers("msg_1", 100, &sig), b"{ }", 100),
            Err(WebhookError::Signature)
        );
        assert_eq!(
            v.verify_at(&headers("msg_2", 100, &sig), body, 100),
            Err(WebhookError::Signature)
        );
        assert_eq!(
            v.verify_at(&headers("msg_1", 100, &sig), body, 100 + TIMESTAMP_TOLERANCE_SECS + 1),
            Err(WebhookError::Stale)
        );
        let other = WebhookVerifier::new("whsec_c2VjcmV0");
        assert_eq!(
            other.verify_at(&headers("msg_1", 100, &sig), body, 100),
            Err(WebhookError::Signature)
        );
    }

    #[test]
    fn missing_secret_or_headers_fail() {
        let body = b"{}";
        let v = WebhookVerifier::new("");
        assert_eq!(
            v.verify_at(&headers("msg_1", 100, "v1,AAAA"), body, 100),
            Err(WebhookError::NoSecret)
        );
        let v = WebhookVerifier::new(SECRET);
        assert_eq!(
            v.verify_at(&HeaderMap::new(), body, 100),
            Err(WebhookError::MissingHeader("svix-id"))
        );
    }

    #[test]
    fn prefix_is_optional() {
        let with = WebhookVerifier::new(SECRET);
        let without = WebhookVerifier::new(SECRET.trim_start_matches(SECRET_PREFIX));
        assert_eq!(with.sign("a", 1, b"x"), without.sign("a", 1, b"x"));
    }

    #[test]
    fn profile_prefers_primary_email() {
        let data: ClerkUserData = serde_json::from_value(serde_json::json!({
            "id": "user_1",
            "first_name": "Ada",
            "last_name": null,
            "email_addresses": [
                {"id": "e1", "email_address": "first@example.com"},
                {"id": "e2", "email_address": "primary@example.com"}
            ],
            "primary_email_address_id": "e2"
        }))
        .unwrap();
        let p = data.to_profile();
        assert_eq!(p.username, "Ada");
        assert_eq!(p.email, "primary@example.com");
        assert_eq!(p.image_url, "");
        assert_eq!(p.clerk_id, "user_1");

        let bare: ClerkUserData = serde_json::from_value(serde_json::json!({"id": "user_2"})).unwrap();
        let p = bare.to_profile();
        assert_eq!(p.username, "");
        assert_eq!(p.email, "");
    }

    #[test]
    fn parse_classifies_events() {
        let created = br#"{"type":"user.created","data":{"id":"user_1"}}"#;
        assert!(matches!(WebhookEvent::parse(created), Ok(WebhookEvent::UserCreated(_))));
        let other = br#"{"type":"session.created","data":{}}"#;
        assert!(matches!(WebhookEvent::parse(other), Ok(WebhookEvent::Other(k)) if k == "session.created"));
        assert!(matches!(WebhookEvent::parse(b"nope"), Err(WebhookError::Payload(_))));
        let bad_user = br#"{"type":"user.updated","data":{}}"#;
        assert!(matches!(WebhookEvent::parse(bad_user), Err(WebhookError::Payload(_))));
    }

    #[tokio::test]
    async fn ingest_upserts_once_per_identity() {
        let store = Store::memory();
        let body = br#"{"type":"user.created","data":{"id":"user_1","first_name":"Ada","last_name":"Lovelace","email_addresses":[{"id":"e1","email_address":"ada@example.com"}]}}"#;

        for _ in 0..2 {
            let event = WebhookEvent::parse(body).unwrap();
            assert_eq!(ingest(&store, event).await.unwrap(), Ingested::Processed);
        }
        let user = users::get_by_clerk_id(&store, "user_1").await.unwrap().unwrap();
        assert_eq!(user.username, "Ada Lovelace");
        assert_eq!(user.email, "ada@example.com");

        let ignored = ingest(&store, WebhookEvent::Other("email.created".into())).await.unwrap();
        assert_eq!(ignored, Ingested::Ignored);
    }
}
