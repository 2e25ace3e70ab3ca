/// Token material: opaque one-time tokens, their digests, and access JWTs
use crate::db::account::AccountRole;
use crate::error::{AuthError, AuthResult};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Bytes of entropy in every opaque token
const OPAQUE_TOKEN_BYTES: usize = 32;

/// Fresh opaque token, hex-encoded
///
/// Used for refresh, verification, and password-reset tokens. The raw value
/// is handed to the client once and never stored.
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Lowercase hex SHA-256 digest, the only form a token is persisted in
pub fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time comparison of token material
pub fn constant_time_eq(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Account id
    pub sub: String,
    /// Session id
    pub sid: String,
    pub role: AccountRole,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints and checks signed access tokens
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, claims: &AccessClaims) -> AuthResult<String>;

    /// Check signature and expiry, returning the claims
    fn verify(&self, token: &str) -> AuthResult<AccessClaims>;
}

/// HS256 JWT issuer keyed by the server secret
pub struct JwtTokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenIssuer {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue(&self, claims: &AccessClaims) -> AuthResult<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("Failed to sign access token: {}", e)))
    }

    fn verify(&self, token: &str) -> AuthResult<AccessClaims> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AuthError::Unauthorized("Access token has expired".to_string())
                }
                _ => AuthError::Unauthorized("Invalid access token".to_string()),
            },
        )?;

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn claims(exp_offset: i64) -> AccessClaims {
        let now = Utc::now().timestamp();
        AccessClaims {
            sub: "account-1".to_string(),
            sid: "session-1".to_string(),
            role: AccountRole::Viewer,
            email: "ada@example.com".to_string(),
            iat: now,
            exp: now + exp_offset,
        }
    }

    #[test]
    fn test_opaque_tokens_are_unique_hex() {
        let a = generate_opaque_token();
        let b = generate_opaque_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_is_lowercase_sha256_hex() {
        assert_eq!(
            digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        let stored = digest("token");
        assert!(constant_time_eq(&stored, &digest("token")));
        assert!(!constant_time_eq(&stored, &digest("other")));
        assert!(!constant_time_eq(&stored, ""));
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = JwtTokenIssuer::new("test-secret-key-for-testing-only-000000");
        let original = claims(900);
        let token = issuer.issue(&original).unwrap();

        assert_eq!(issuer.verify(&token).unwrap(), original);
    }

    #[test]
    fn test_verify_rejects_other_secret() {
        let issuer = JwtTokenIssuer::new("test-secret-key-for-testing-only-000000");
        let other = JwtTokenIssuer::new("another-secret-key-for-testing-only-111");
        let token = other.issue(&claims(900)).unwrap();

        assert!(matches!(issuer.verify(&token), Err(AuthError::Unauthorized(_))));
    }

    #[test]
    fn test_verify_rejects_expired() {
        let issuer = JwtTokenIssuer::new("test-secret-key-for-testing-only-000000");
        let token = issuer.issue(&claims(-10)).unwrap();

        match issuer.verify(&token) {
            Err(AuthError::Unauthorized(msg)) => assert_eq!(msg, "Access token has expired"),
            other => panic!("Expected Unauthorized, got {:?}", other),
        }
    }
}
