/// External identity verification
///
/// Turns an ID token from a third-party identity provider into a verified
/// identity the account layer can sign in or provision.

pub mod google;

pub use google::GoogleIdTokenVerifier;

use crate::db::account::IdentityProvider;
use crate::error::AuthResult;
use async_trait::async_trait;

/// Identity asserted by an external provider after its token checked out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub provider: IdentityProvider,
    /// Provider-scoped stable user id
    pub subject: String,
    pub email: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Verifies provider-issued ID tokens
#[async_trait]
pub trait ExternalIdentityVerifier: Send + Sync {
    /// Any failure is `Unauthorized`
    async fn verify(&self, id_token: &str) -> AuthResult<ExternalIdentity>;
}

/// Verifier backed by a fixed token table
#[cfg(test)]
pub(crate) struct StaticIdentityVerifier {
    identities: std::collections::HashMap<String, ExternalIdentity>,
}

#[cfg(test)]
impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self {
            identities: std::collections::HashMap::new(),
        }
    }

    pub fn with_google(mut self, token: &str, subject: &str, email: &str, name: Option<&str>) -> Self {
        self.identities.insert(
            token.to_string(),
            ExternalIdentity {
                provider: IdentityProvider::Google,
                subject: subject.to_string(),
                email: email.to_string(),
                full_name: name.map(str::to_string),
                avatar_url: None,
            },
        );
        self
    }
}

#[cfg(test)]
#[async_trait]
impl ExternalIdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, id_token: &str) -> AuthResult<ExternalIdentity> {
        self.identities.get(id_token).cloned().ok_or_else(|| {
            crate::error::AuthError::Unauthorized("Invalid Google token".to_string())
        })
    }
}
