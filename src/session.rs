//! Opaque bearer tokens with server-side revocable records.
//!
//! A token is base64 JSON carrying a proof, the storage key for its record,
//! and the identity it was minted for. Nothing in the token is secret on its
//! own: validity requires the server-side record to still exist and the
//! HMAC proof to match the identity stored in it, which is what makes
//! revocation take effect immediately.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AppError;
use crate::transient::TransientStore;

const SESSION_PREFIX: &str = "session:";
const ACTION_PREFIX: &str = "contextual_chat_auth";

/// Anonymous visitors authenticate as user 0.
pub const ANONYMOUS_USER: i64 = 0;

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    proof: String,
    key: String,
    user_id: i64,
    session_id: String,
}

/// What the server remembers about an issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: i64,
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub claims: Value,
}

/// Result of minting a token, pre-digested for the HTTP layer.
pub struct IssuedToken {
    pub token: String,
    pub user_id: i64,
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

pub struct SessionAuthenticator {
    store: Arc<TransientStore>,
    secret: String,
    ttl_secs: i64,
}

impl SessionAuthenticator {
    pub fn new(store: Arc<TransientStore>, secret: String, ttl_secs: i64) -> Self {
        SessionAuthenticator {
            store,
            secret,
            ttl_secs,
        }
    }

    /// Mints a token for `user_id`, reusing `session_id` when the widget
    /// already has one so conversation history stays correlated.
    pub async fn issue(
        &self,
        user_id: i64,
        session_id: Option<String>,
        claims: Value,
    ) -> Result<IssuedToken, AppError> {
        self.issue_at(user_id, session_id, claims, Utc::now()).await
    }

    pub async fn issue_at(
        &self,
        user_id: i64,
        session_id: Option<String>,
        claims: Value,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AppError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let proof = self.proof_for(user_id, &session_id);
        let storage_key = record_key(&proof);

        let issued_at = now;
        let expires_at = now + Duration::seconds(self.ttl_secs);
        let record = SessionRecord {
            user_id,
            session_id: session_id.clone(),
            issued_at,
            expires_at,
            claims,
        };
        let record_value = serde_json::to_value(&record)
            .map_err(|e| AppError::Internal(format!("failed to serialize session record: {}", e)))?;
        self.store
            .set_at(&storage_key, record_value, Some(self.ttl_secs), now)
            .await;

        let payload = TokenPayload {
            proof,
            key: storage_key,
            user_id,
            session_id: session_id.clone(),
        };
        let encoded = serde_json::to_string(&payload)
            .map_err(|e| AppError::Internal(format!("failed to encode token: {}", e)))?;
        let token = base64_simd::STANDARD.encode_to_string(encoded.as_bytes());

        tracing::debug!(user_id, session_id = %session_id, "issued session token");

        Ok(IssuedToken {
            token,
            user_id,
            session_id,
            issued_at,
            expires_at,
            expires_in: self.ttl_secs,
        })
    }

    /// Checks a presented token. Malformed tokens, missing records, proof
    /// mismatches, and expiry all come back as `None`; callers never learn
    /// which one it was.
    pub async fn verify(&self, token: &str) -> Option<SessionRecord> {
        self.verify_at(token, Utc::now()).await
    }

    pub async fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Option<SessionRecord> {
        let payload = decode_payload(token)?;

        let record_value = self.store.get_at(&payload.key, now).await?;
        let record: SessionRecord = serde_json::from_value(record_value).ok()?;

        // The proof is recomputed from the stored identity, not the one the
        // client claims in the payload.
        let expected = self.proof_for(record.user_id, &record.session_id);
        let matches: bool = expected
            .as_bytes()
            .ct_eq(payload.proof.as_bytes())
            .into();
        if !matches {
            return None;
        }

        if now > record.expires_at {
            self.store.delete(&payload.key).await;
            return None;
        }

        Some(record)
    }

    /// Deletes the server-side record for a token. Returns whether a record
    /// was actually removed; revoking twice is fine and reports `false`.
    pub async fn revoke(&self, token: &str) -> bool {
        let Some(payload) = decode_payload(token) else {
            return false;
        };
        let removed = self.store.delete(&payload.key).await;
        if removed {
            tracing::debug!(session_id = %payload.session_id, "revoked session token");
        }
        removed
    }

    fn proof_for(&self, user_id: i64, session_id: &str) -> String {
        let action = format!("{}_{}_{}", ACTION_PREFIX, user_id, session_id);
        let key = hmac::Key::new(hmac::HMAC_SHA256, self.secret.as_bytes());
        let tag = hmac::sign(&key, action.as_bytes());
        hex::encode(tag.as_ref())
    }
}

fn record_key(proof: &str) -> String {
    let digest = Sha256::digest(proof.as_bytes());
    format!("{}{}", SESSION_PREFIX, hex::encode(digest))
}

fn decode_payload(token: &str) -> Option<TokenPayload> {
    let raw = base64_simd::STANDARD.decode_to_vec(token).ok()?;
    serde_json::from_slice(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authenticator(ttl_secs: i64) -> SessionAuthenticator {
        SessionAuthenticator::new(
            Arc::new(TransientStore::new()),
            "unit-test-secret".to_string(),
            ttl_secs,
        )
    }

    #[tokio::test]
    async fn issue_then_verify_round_trips_claims() {
        let auth = authenticator(900);
        let issued = auth
            .issue(7, None, json!({"scope": "chat"}))
            .await
            .unwrap();

        let record = auth.verify(&issued.token).await.expect("token should verify");
        assert_eq!(record.user_id, 7);
        assert_eq!(record.session_id, issued.session_id);
        assert_eq!(record.claims["scope"], "chat");
        assert_eq!(issued.expires_in, 900);
    }

    #[tokio::test]
    async fn anonymous_issue_uses_user_zero() {
        let auth = authenticator(900);
        let issued = auth.issue(ANONYMOUS_USER, None, json!({})).await.unwrap();
        let record = auth.verify(&issued.token).await.unwrap();
        assert_eq!(record.user_id, 0);
    }

    #[tokio::test]
    async fn supplied_session_id_is_kept() {
        let auth = authenticator(900);
        let issued = auth
            .issue(0, Some("widget-session-1".to_string()), json!({}))
            .await
            .unwrap();
        assert_eq!(issued.session_id, "widget-session-1");
    }

    #[tokio::test]
    async fn token_is_valid_through_its_deadline_and_not_after() {
        let auth = authenticator(900);
        let t0 = Utc::now();
        let issued = auth.issue_at(0, None, json!({}), t0).await.unwrap();

        let at_deadline = t0 + Duration::seconds(900);
        assert!(auth.verify_at(&issued.token, at_deadline).await.is_some());

        let past = at_deadline + Duration::seconds(1);
        assert!(auth.verify_at(&issued.token, past).await.is_none());

        // Expiry removed the record, so the token stays dead even if the
        // clock were to run backwards.
        assert!(auth.verify_at(&issued.token, t0).await.is_none());
    }

    #[tokio::test]
    async fn revocation_is_immediate_and_idempotent() {
        let auth = authenticator(900);
        let issued = auth.issue(3, None, json!({})).await.unwrap();

        assert!(auth.verify(&issued.token).await.is_some());
        assert!(auth.revoke(&issued.token).await);
        assert!(auth.verify(&issued.token).await.is_none());
        assert!(!auth.revoke(&issued.token).await);
    }

    #[tokio::test]
    async fn malformed_tokens_are_rejected() {
        let auth = authenticator(900);
        assert!(auth.verify("").await.is_none());
        assert!(auth.verify("not base64 !!!").await.is_none());

        let not_json = base64_simd::STANDARD.encode_to_string(b"just some text");
        assert!(auth.verify(&not_json).await.is_none());
    }

    #[tokio::test]
    async fn tampered_proof_is_rejected() {
        let auth = authenticator(900);
        let issued = auth.issue(1, None, json!({})).await.unwrap();

        let raw = base64_simd::STANDARD.decode_to_vec(&issued.token).unwrap();
        let mut payload: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let mut proof = payload["proof"].as_str().unwrap().to_string();
        let flipped = if proof.remove(0) == 'a' { 'b' } else { 'a' };
        payload["proof"] = json!(format!("{}{}", flipped, proof));

        let forged =
            base64_simd::STANDARD.encode_to_string(payload.to_string().as_bytes());
        assert!(auth.verify(&forged).await.is_none());
    }

    #[tokio::test]
    async fn tokens_do_not_verify_under_a_different_secret() {
        let store = Arc::new(TransientStore::new());
        let issuer =
            SessionAuthenticator::new(Arc::clone(&store), "secret-a".to_string(), 900);
        let other = SessionAuthenticator::new(store, "secret-b".to_string(), 900);

        let issued = issuer.issue(1, None, json!({})).await.unwrap();
        assert!(issuer.verify(&issued.token).await.is_some());
        assert!(other.verify(&issued.token).await.is_none());
    }

    #[tokio::test]
    async fn revoking_garbage_reports_false() {
        let auth = authenticator(900);
        assert!(!auth.revoke("???").await);
    }
}
