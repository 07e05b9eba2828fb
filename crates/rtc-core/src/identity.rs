//! Presence & token validation
//!
//! The embedding application hands over a loosely shaped user record plus an
//! opaque token. This module turns that into a resolved identity and checks
//! the token against an issuer.
//!
//! # Identity resolution
//!
//! The user id may live under several field names depending on which backend
//! produced the record. Candidates are tried in the fixed order of
//! [`USER_ID_FIELDS`] and the first present, non-empty value wins.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::crypto::{TokenClaims, TokenKey};
use crate::error::AuthError;
use crate::types::unix_now;

/// Field names that may carry the user id, in priority order
pub const USER_ID_FIELDS: &[&str] = &["user_id", "id", "uuid"];

/// Display name used when the record carries none
pub const FALLBACK_DISPLAY_NAME: &str = "User";

/// A user record as supplied by the embedding application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityRecord(Map<String, Value>);

impl IdentityRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Parse a JSON object; anything that is not an object is rejected
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Resolve the user id by trying each candidate field in order
    pub fn resolve_user_id(&self) -> Result<String, AuthError> {
        USER_ID_FIELDS
            .iter()
            .find_map(|field| self.scalar(field))
            .ok_or(AuthError::MissingIdentity)
    }

    /// `name`, else `first_name last_name`, else a generic fallback
    pub fn display_name(&self) -> String {
        if let Some(name) = self.scalar("name") {
            return name;
        }

        let first = self.scalar("first_name").unwrap_or_default();
        let last = self.scalar("last_name").unwrap_or_default();
        let joined = format!("{} {}", first, last).trim().to_string();

        if joined.is_empty() {
            FALLBACK_DISPLAY_NAME.to_string()
        } else {
            joined
        }
    }

    /// Avatar reference, made absolute against `asset_origin` when relative
    pub fn avatar_ref(&self, asset_origin: Option<&str>) -> Option<String> {
        let avatar = self.scalar("avatar_url")?;
        if avatar.starts_with("http://") || avatar.starts_with("https://") {
            return Some(avatar);
        }

        match asset_origin {
            Some(origin) => Some(format!(
                "{}/{}",
                origin.trim_end_matches('/'),
                avatar.trim_start_matches('/')
            )),
            None => Some(avatar),
        }
    }

    /// A non-empty string or integer value for `field`
    fn scalar(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Result of a successful validation
///
/// Derived fresh on every channel open; never cached across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    /// Token expiry as Unix seconds
    pub expires_at: u64,
}

impl AuthContext {
    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(unix_now())
    }
}

/// External token issuer
///
/// Implementations may call out over the network; callers bound the call
/// with their own timeout.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, user_id: &str, token: &str, now: u64) -> Result<TokenClaims, AuthError>;
}

/// Verifier backed by a shared MAC key
pub struct KeyedTokenVerifier {
    key: TokenKey,
}

impl KeyedTokenVerifier {
    pub fn new(key: TokenKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl TokenVerifier for KeyedTokenVerifier {
    async fn verify(&self, user_id: &str, token: &str, now: u64) -> Result<TokenClaims, AuthError> {
        self.key.verify(user_id, token, now)
    }
}

/// Presence & token validator
#[derive(Clone)]
pub struct Validator {
    verifier: Arc<dyn TokenVerifier>,
}

impl Validator {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Validator using the bundled keyed-MAC issuer
    pub fn with_key(key: TokenKey) -> Self {
        Self::new(Arc::new(KeyedTokenVerifier::new(key)))
    }

    /// Validate `(user_id, token)` now
    pub async fn validate(&self, user_id: &str, token: &str) -> Result<AuthContext, AuthError> {
        self.validate_at(user_id, token, unix_now()).await
    }

    /// Validate `(user_id, token)` as of `now` (Unix seconds)
    pub async fn validate_at(
        &self,
        user_id: &str,
        token: &str,
        now: u64,
    ) -> Result<AuthContext, AuthError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            warn!("Validation rejected: missing user id");
            return Err(AuthError::MissingIdentity);
        }

        let claims = self.verifier.verify(user_id, token, now).await?;
        debug!("Validated user {} (expires {})", user_id, claims.expires_at);

        Ok(AuthContext {
            user_id: user_id.to_string(),
            expires_at: claims.expires_at,
        })
    }

    /// Resolve the id from a record, then validate
    pub async fn validate_record(
        &self,
        record: &IdentityRecord,
        token: &str,
    ) -> Result<AuthContext, AuthError> {
        let user_id = record.resolve_user_id()?;
        self.validate(&user_id, token).await
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> IdentityRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_fallback_id() {
        let r = record(json!({ "id": "u1" }));
        assert_eq!(r.resolve_user_id().unwrap(), "u1");
    }

    #[test]
    fn test_resolve_empty_record() {
        let r = record(json!({}));
        assert_eq!(r.resolve_user_id(), Err(AuthError::MissingIdentity));
    }

    #[test]
    fn test_resolve_priority_order() {
        let r = record(json!({ "uuid": "c", "id": "b", "user_id": "a" }));
        assert_eq!(r.resolve_user_id().unwrap(), "a");

        let r = record(json!({ "uuid": "c", "id": "b" }));
        assert_eq!(r.resolve_user_id().unwrap(), "b");

        let r = record(json!({ "uuid": "c" }));
        assert_eq!(r.resolve_user_id().unwrap(), "c");
    }

    #[test]
    fn test_resolve_skips_blank_and_null() {
        let r = record(json!({ "user_id": "  ", "id": null, "uuid": "c" }));
        assert_eq!(r.resolve_user_id().unwrap(), "c");
    }

    #[test]
    fn test_resolve_numeric_id() {
        let r = record(json!({ "id": 42 }));
        assert_eq!(r.resolve_user_id().unwrap(), "42");

        let r = record(json!({ "id": 4.2 }));
        assert_eq!(r.resolve_user_id(), Err(AuthError::MissingIdentity));
    }

    #[test]
    fn test_non_object_record_rejected() {
        assert!(IdentityRecord::from_json("[1,2]").is_err());
        assert!(IdentityRecord::from_json(r#"{"id":"u1"}"#).is_ok());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(record(json!({ "name": "Alice" })).display_name(), "Alice");
        assert_eq!(
            record(json!({ "first_name": "Bob", "last_name": "Stone" })).display_name(),
            "Bob Stone"
        );
        assert_eq!(record(json!({ "first_name": "Bob" })).display_name(), "Bob");
        assert_eq!(record(json!({})).display_name(), FALLBACK_DISPLAY_NAME);
    }

    #[test]
    fn test_avatar_ref() {
        let r = record(json!({ "avatar_url": "/media/a.jpg" }));
        assert_eq!(
            r.avatar_ref(Some("https://cdn.example.com/")).unwrap(),
            "https://cdn.example.com/media/a.jpg"
        );
        assert_eq!(r.avatar_ref(None).unwrap(), "/media/a.jpg");

        let r = record(json!({ "avatar_url": "https://x.test/a.jpg" }));
        assert_eq!(r.avatar_ref(Some("https://cdn")).unwrap(), "https://x.test/a.jpg");

        assert!(record(json!({})).avatar_ref(Some("https://cdn")).is_none());
    }

    #[tokio::test]
    async fn test_validate_then_expire() {
        let key = TokenKey::from_secret("s3cret");
        let validator = Validator::with_key(key.clone());
        let token = key.issue("u1", 2_000);

        let ctx = validator.validate_at("u1", &token, 1_000).await.unwrap();
        assert_eq!(ctx.user_id, "u1");
        assert!(ctx.is_valid_at(1_999));
        assert!(!ctx.is_valid_at(2_000));

        // Revalidation after expiry must fail
        let err = validator.validate_at("u1", &token, 2_001).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    #[tokio::test]
    async fn test_validate_missing_identity() {
        let validator = Validator::with_key(TokenKey::from_secret("s3cret"));
        let err = validator.validate_at("  ", "1.abc", 0).await.unwrap_err();
        assert_eq!(err, AuthError::MissingIdentity);
    }

    #[tokio::test]
    async fn test_validate_record() {
        let key = TokenKey::from_secret("s3cret");
        let validator = Validator::with_key(key.clone());
        let token = key.issue("u1", unix_now() + 60);

        let ctx = validator
            .validate_record(&record(json!({ "id": "u1" })), &token)
            .await
            .unwrap();
        assert_eq!(ctx.user_id, "u1");

        let err = validator
            .validate_record(&record(json!({})), &token)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::MissingIdentity);
    }

    #[tokio::test]
    async fn test_token_for_other_user_rejected() {
        let key = TokenKey::from_secret("s3cret");
        let validator = Validator::with_key(key.clone());
        let token = key.issue("u1", unix_now() + 60);

        let err = validator.validate("u2", &token).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }
}
