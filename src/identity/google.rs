/// Google ID token verification against Google's published signing keys
use super::{ExternalIdentity, ExternalIdentityVerifier};
use crate::db::account::IdentityProvider;
use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const GOOGLE_CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// How long a fetched key set is trusted
const KEY_SET_TTL: Duration = Duration::from_secs(3600);
/// Minimum age before an unknown `kid` triggers a refetch
const KEY_REFETCH_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct GoogleClaims {
    sub: String,
    email: Option<String>,
    email_verified: Option<bool>,
    name: Option<String>,
    picture: Option<String>,
}

struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Verifies Google-issued ID tokens (RS256, audience = our client id)
pub struct GoogleIdTokenVerifier {
    client_id: Option<String>,
    http_client: reqwest::Client,
    keys: RwLock<Option<CachedKeys>>,
}

fn rejected() -> AuthError {
    AuthError::Unauthorized("Invalid Google token".to_string())
}

impl GoogleIdTokenVerifier {
    pub fn new(client_id: Option<String>, timeout: Duration) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("reelio-auth/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client_id,
            http_client,
            keys: RwLock::new(None),
        })
    }

    #[cfg(test)]
    fn with_keys(client_id: &str, keys: JwkSet) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            http_client: reqwest::Client::new(),
            keys: RwLock::new(Some(CachedKeys {
                keys,
                fetched_at: Instant::now(),
            })),
        }
    }

    async fn fetch_keys(&self) -> AuthResult<JwkSet> {
        let response = self
            .http_client
            .get(GOOGLE_CERTS_URL)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to fetch Google signing keys");
                rejected()
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Google signing key endpoint returned error");
            return Err(rejected());
        }

        response.json::<JwkSet>().await.map_err(|e| {
            warn!(error = %e, "Google signing keys were not a valid JWK set");
            rejected()
        })
    }

    /// Decoding key for `kid`, fetching the key set when stale or missing it
    async fn decoding_key(&self, kid: &str) -> AuthResult<DecodingKey> {
        let refetch = {
            let cache = self.keys.read().await;
            match cache.as_ref() {
                Some(cached) if cached.fetched_at.elapsed() < KEY_SET_TTL => {
                    if let Some(jwk) = cached.keys.find(kid) {
                        return DecodingKey::from_jwk(jwk).map_err(|_| rejected());
                    }
                    cached.fetched_at.elapsed() >= KEY_REFETCH_COOLDOWN
                }
                _ => true,
            }
        };

        if !refetch {
            debug!(kid, "Unknown Google key id within refetch cooldown");
            return Err(rejected());
        }

        let keys = self.fetch_keys().await?;
        let key = keys
            .find(kid)
            .map(DecodingKey::from_jwk)
            .transpose()
            .map_err(|_| rejected())?;

        *self.keys.write().await = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });

        key.ok_or_else(rejected)
    }
}

#[async_trait]
impl ExternalIdentityVerifier for GoogleIdTokenVerifier {
    async fn verify(&self, id_token: &str) -> AuthResult<ExternalIdentity> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or_else(|| AuthError::Unauthorized("Google sign-in is not configured".to_string()))?;

        let header = decode_header(id_token).map_err(|_| rejected())?;
        if header.alg != Algorithm::RS256 {
            return Err(rejected());
        }
        let kid = header.kid.ok_or_else(rejected)?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[client_id]);
        validation.set_issuer(&GOOGLE_ISSUERS);

        let claims = decode::<GoogleClaims>(id_token, &key, &validation)
            .map_err(|e| {
                debug!(error = %e, "Google ID token rejected");
                rejected()
            })?
            .claims;

        if claims.email_verified != Some(true) {
            return Err(AuthError::Unauthorized(
                "Google account email is not verified".to_string(),
            ));
        }
        let email = claims.email.ok_or_else(rejected)?;

        Ok(ExternalIdentity {
            provider: IdentityProvider::Google,
            subject: claims.sub,
            email,
            full_name: claims.name,
            avatar_url: claims.picture,
        })
    }
}
