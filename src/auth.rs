/// Authentication extractor for bearer access tokens
use crate::{
    account::ValidatedSession, api::middleware::extract_bearer_token, context::AppContext,
    error::AuthError,
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// Authenticated caller, resolved from the `Authorization: Bearer` header
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub session: ValidatedSession,
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)
            .ok_or_else(|| AuthError::Unauthorized("Missing authorization header".to_string()))?;

        let session = state.account_manager.authenticate(&token).await?;

        Ok(AuthContext { session })
    }
}
