//! Cryptographic utilities
//!
//! Provides:
//! - Auth token issuing and verification (BLAKE3 keyed MAC)
//! - BLAKE3 content digests for pinned coordinator code
//! - Random connection identifiers

use tracing::debug;

use crate::error::AuthError;

/// Context string for deriving the token MAC key from the configured secret
const TOKEN_KEY_CONTEXT: &str = "rtc-embed 2025-08 auth token v1";

/// Tokens longer than this are rejected before any parsing
pub const MAX_TOKEN_LEN: usize = 512;

/// Length of the hex-encoded MAC part of a token
const MAC_HEX_LEN: usize = blake3::OUT_LEN * 2;

/// Claims carried by a verified token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    /// Expiry as Unix seconds
    pub expires_at: u64,
}

/// Issues and verifies `"<expires_at>.<hex mac>"` tokens bound to a user id
#[derive(Clone)]
pub struct TokenKey {
    key: [u8; 32],
}

impl TokenKey {
    /// Derive the MAC key from an arbitrary secret string
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(TOKEN_KEY_CONTEXT, secret.as_bytes()),
        }
    }

    /// Generate a random key (used when no secret is configured)
    pub fn random() -> Result<Self, getrandom::Error> {
        let mut key = [0u8; 32];
        getrandom::fill(&mut key)?;
        Ok(Self { key })
    }

    fn mac(&self, user_id: &str, expires_at: u64) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(user_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires_at.to_string().as_bytes());
        hasher.finalize()
    }

    /// Issue a token for `user_id` that expires at `expires_at` (Unix seconds)
    pub fn issue(&self, user_id: &str, expires_at: u64) -> String {
        format!("{}.{}", expires_at, self.mac(user_id, expires_at).to_hex())
    }

    /// Verify a token against `user_id` at time `now` (Unix seconds)
    pub fn verify(&self, user_id: &str, token: &str, now: u64) -> Result<TokenClaims, AuthError> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            debug!("Token rejected: length {}", token.len());
            return Err(AuthError::InvalidToken);
        }

        let (expiry, mac_hex) = token.split_once('.').ok_or(AuthError::InvalidToken)?;
        let expires_at: u64 = expiry.parse().map_err(|_| AuthError::InvalidToken)?;
        // One token string per claim: no sign, no leading zeros
        if expires_at.to_string() != expiry {
            debug!("Token rejected: non-canonical expiry");
            return Err(AuthError::InvalidToken);
        }

        if mac_hex.len() != MAC_HEX_LEN {
            debug!("Token rejected: bad mac length");
            return Err(AuthError::InvalidToken);
        }
        let presented = blake3::Hash::from_hex(mac_hex).map_err(|_| AuthError::InvalidToken)?;

        // blake3::Hash equality is constant-time
        if presented != self.mac(user_id, expires_at) {
            debug!("Token rejected: mac mismatch");
            return Err(AuthError::InvalidToken);
        }

        if now >= expires_at {
            debug!("Token rejected: expired at {}", expires_at);
            return Err(AuthError::InvalidToken);
        }

        Ok(TokenClaims { expires_at })
    }
}

impl std::fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenKey([REDACTED])")
    }
}

/// Hex-encoded BLAKE3 digest of data
pub fn content_digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Verify data against a hex-encoded BLAKE3 digest
pub fn verify_digest(data: &[u8], expected_hex: &str) -> bool {
    match blake3::Hash::from_hex(expected_hex.trim()) {
        Ok(expected) => blake3::hash(data) == expected,
        Err(_) => false,
    }
}

/// Generate a random 16-hex-char identifier for a connection
pub fn generate_connection_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let key = TokenKey::from_secret("s3cret");
        let token = key.issue("u1", 1_000);

        let claims = key.verify("u1", &token, 999).unwrap();
        assert_eq!(claims.expires_at, 1_000);
    }

    #[test]
    fn test_token_expired() {
        let key = TokenKey::from_secret("s3cret");
        let token = key.issue("u1", 1_000);

        assert_eq!(key.verify("u1", &token, 1_000), Err(AuthError::InvalidToken));
        assert_eq!(key.verify("u1", &token, 5_000), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_token_bound_to_user() {
        let key = TokenKey::from_secret("s3cret");
        let token = key.issue("u1", 1_000);
        assert_eq!(key.verify("u2", &token, 10), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_token_bound_to_key() {
        let token = TokenKey::from_secret("a").issue("u1", 1_000);
        let other = TokenKey::from_secret("b");
        assert_eq!(other.verify("u1", &token, 10), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_tampered_expiry_rejected() {
        let key = TokenKey::from_secret("s3cret");
        let token = key.issue("u1", 1_000);
        let (_, mac) = token.split_once('.').unwrap();
        let forged = format!("9999999999.{}", mac);
        assert_eq!(key.verify("u1", &forged, 10), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_expiry_must_be_canonical() {
        let key = TokenKey::from_secret("s3cret");
        let token = key.issue("u1", 1_000);
        let (_, mac) = token.split_once('.').unwrap();

        assert!(key.verify("u1", &token, 10).is_ok());
        for expiry in ["+1000", "01000", "0001000"] {
            let variant = format!("{}.{}", expiry, mac);
            assert_eq!(key.verify("u1", &variant, 10), Err(AuthError::InvalidToken), "{}", expiry);
        }
    }

    #[test]
    fn test_malformed_tokens() {
        let key = TokenKey::from_secret("s3cret");
        let oversized = "1".repeat(MAX_TOKEN_LEN + 1);
        for bad in ["", "no-dot", "abc.def", "100.zz", oversized.as_str()] {
            assert_eq!(key.verify("u1", bad, 10), Err(AuthError::InvalidToken), "{}", bad);
        }
    }

    #[test]
    fn test_random_keys_differ() {
        let a = TokenKey::random().unwrap();
        let b = TokenKey::random().unwrap();
        let token = a.issue("u1", 1_000);
        assert!(b.verify("u1", &token, 10).is_err());
    }

    #[test]
    fn test_content_digest() {
        let digest = content_digest(b"console.log('embed')");
        assert_eq!(digest.len(), 64);
        assert!(verify_digest(b"console.log('embed')", &digest));
        assert!(!verify_digest(b"console.log('tampered')", &digest));
        assert!(!verify_digest(b"anything", "not-hex"));
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = generate_connection_id().unwrap();
        let id2 = generate_connection_id().unwrap();

        assert_eq!(id1.len(), 16); // 8 bytes = 16 hex chars
        assert_ne!(id1, id2);
    }
}
