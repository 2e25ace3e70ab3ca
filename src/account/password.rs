/// Argon2id credential hashing off the async runtime
use crate::error::{AuthError, AuthResult};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};
use std::sync::Arc;
use std::time::Duration;

/// Hashes and verifies passwords on the blocking pool under a deadline
#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
    timeout: Duration,
    /// Hash verified against when no account exists, to even out timing
    dummy_hash: Arc<String>,
}

impl CredentialHasher {
    /// Hasher with the argon2 crate's default Argon2id cost
    pub fn new(timeout: Duration) -> AuthResult<Self> {
        Self::with_params(Params::default(), timeout)
    }

    pub fn with_params(params: Params, timeout: Duration) -> AuthResult<Self> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone());
        let salt = SaltString::generate(&mut OsRng);
        let dummy_hash = argon2
            .hash_password(b"not-a-real-password", &salt)
            .map_err(|e| AuthError::Internal(format!("Failed to prepare hasher: {}", e)))?
            .to_string();

        Ok(Self {
            params,
            timeout,
            dummy_hash: Arc::new(dummy_hash),
        })
    }

    /// Derive a PHC-format hash for a new credential
    pub async fn hash(&self, password: &str) -> AuthResult<String> {
        let password = password.to_owned();
        let params = self.params.clone();

        self.run_blocking(move || {
            let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| AuthError::Internal(format!("Failed to hash password: {}", e)))
        })
        .await
    }

    /// Check a password against a stored hash
    pub async fn verify(&self, password: &str, stored_hash: &str) -> AuthResult<bool> {
        let password = password.to_owned();
        let stored_hash = stored_hash.to_owned();

        self.run_blocking(move || {
            let parsed = PasswordHash::new(&stored_hash)
                .map_err(|e| AuthError::Internal(format!("Stored hash is malformed: {}", e)))?;
            Ok(Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok())
        })
        .await
    }

    /// Spend a verification's worth of time without a real credential
    pub async fn verify_dummy(&self, password: &str) {
        let dummy = Arc::clone(&self.dummy_hash);
        if let Err(e) = self.verify(password, &dummy).await {
            tracing::warn!(error = %e, "Dummy password verification failed");
        }
    }

    async fn run_blocking<T, F>(&self, work: F) -> AuthResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AuthResult<T> + Send + 'static,
    {
        tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(work))
            .await
            .map_err(|_| AuthError::Internal("Password hashing timed out".to_string()))?
            .map_err(|e| AuthError::Internal(format!("Password hashing task failed: {}", e)))?
    }
}

/// Cheap parameters so tests do not spend seconds per hash
#[cfg(test)]
pub(crate) fn test_hasher() -> CredentialHasher {
    let params = Params::new(1024, 1, 1, None).unwrap();
    CredentialHasher::with_params(params, Duration::from_secs(5)).unwrap()
}
