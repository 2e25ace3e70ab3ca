/// Account management system
///
/// Handles account creation, credential checks, email verification, password
/// reset, and session issuance and rotation.

pub(crate) mod manager;
pub mod password;
pub mod password_reset;
pub mod session;
pub mod tokens;
pub mod verification;

pub use manager::{AccountManager, Collaborators, SignedIn};
pub use session::{IssuedSession, Provenance, RotatedTokens};

use crate::db::account::{Account, AccountRole};
use crate::db::session::Session;
use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Run derive-based validation, mapping failures to `AuthError::Validation`
pub(crate) fn validate_request<T: Validate>(request: &T) -> AuthResult<()> {
    request
        .validate()
        .map_err(|e| AuthError::Validation(e.to_string()))
}

/// Account creation request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[validate(email(message = "Email must be a valid email address"))]
    pub email: String,
    #[validate(length(min = 8, max = 128, message = "Password must be 8 to 128 characters"))]
    pub password: String,
    #[validate(length(max = 100, message = "Full name must be at most 100 characters"))]
    pub full_name: Option<String>,
}

/// Password sign-in request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SigninRequest {
    #[validate(email(message = "Email must be a valid email address"))]
    pub email: String,
    #[validate(length(min = 1, max = 128, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GoogleSigninRequest {
    #[validate(length(min = 1, message = "ID token is required"))]
    pub id_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEmailQuery {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    #[validate(length(min = 1, message = "User id is required"))]
    pub user_id: String,
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RequestPasswordResetRequest {
    #[validate(email(message = "Email must be a valid email address"))]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1, message = "Reset token is required"))]
    pub token: String,
    #[validate(length(min = 8, max = 128, message = "Password must be 8 to 128 characters"))]
    pub new_password: String,
}

/// Public projection of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: AccountRole,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            email: account.email.clone(),
            full_name: account.full_name.clone(),
            role: account.role,
            avatar_url: account.avatar_url.clone(),
            email_verified: account.email_verified,
        }
    }
}

/// Tokens handed to the client when a session is created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&IssuedSession> for SessionView {
    fn from(issued: &IssuedSession) -> Self {
        Self {
            id: issued.session.id.clone(),
            access_token: issued.session.access_token.clone(),
            access_token_expires_at: issued.session.access_token_expires_at,
            refresh_token: issued.refresh_token.clone(),
            refresh_token_expires_at: issued.session.refresh_token_expires_at,
            created_at: issued.session.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupResponse {
    pub user: AccountView,
}

/// Response for every flow that ends in a new session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: AccountView,
    pub session: SessionView,
}

impl From<&SignedIn> for AuthResponse {
    fn from(signed_in: &SignedIn) -> Self {
        Self {
            user: AccountView::from(&signed_in.account),
            session: SessionView::from(&signed_in.session),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEmailResponse {
    pub message: String,
    pub user: AccountView,
    pub session: SessionView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenResponse {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

impl From<RotatedTokens> for RefreshTokenResponse {
    fn from(rotated: RotatedTokens) -> Self {
        Self {
            access_token: rotated.access_token,
            access_token_expires_at: rotated.access_token_expires_at,
            refresh_token: rotated.refresh_token,
            refresh_token_expires_at: rotated.refresh_token_expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Session metadata shown to its owner; never carries token material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionInfo {
    pub id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub current: bool,
}

impl ActiveSessionInfo {
    pub fn from_session(session: &Session, current_session_id: &str) -> Self {
        Self {
            id: session.id.clone(),
            ip_address: session.ip_address.clone(),
            user_agent: session.user_agent.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            refresh_token_expires_at: session.refresh_token_expires_at,
            current: session.id == current_session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<ActiveSessionInfo>,
}

/// Identity behind the bearer token of the current request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSessionResponse {
    pub user_id: String,
    pub session_id: String,
    pub email: String,
    pub role: AccountRole,
}

impl From<&ValidatedSession> for CurrentSessionResponse {
    fn from(validated: &ValidatedSession) -> Self {
        Self {
            user_id: validated.account_id.clone(),
            session_id: validated.session_id.clone(),
            email: validated.email.clone(),
            role: validated.role,
        }
    }
}

/// Identity carried by a valid bearer access token
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub account_id: String,
    pub session_id: String,
    pub email: String,
    pub role: AccountRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signup_validation() {
        let ok = SignupRequest {
            email: "ada@example.com".to_string(),
            password: "password123".to_string(),
            full_name: None,
        };
        assert!(validate_request(&ok).is_ok());

        let short = SignupRequest {
            password: "short".to_string(),
            ..ok.clone()
        };
        assert!(matches!(validate_request(&short), Err(AuthError::Validation(_))));

        let bad_email = SignupRequest {
            email: "not-an-email".to_string(),
            ..ok
        };
        assert!(matches!(validate_request(&bad_email), Err(AuthError::Validation(_))));
    }

    #[test]
    fn test_request_field_names() {
        let request: RefreshTokenRequest =
            serde_json::from_str(r#"{"userId":"u1","refreshToken":"r1"}"#).unwrap();
        assert_eq!(request.user_id, "u1");

        let request: ResetPasswordRequest =
            serde_json::from_str(r#"{"token":"t","newPassword":"password123"}"#).unwrap();
        assert_eq!(request.new_password, "password123");
    }

    #[test]
    fn test_refresh_response_omits_unrotated_refresh_token() {
        let response = RefreshTokenResponse {
            access_token: "a".to_string(),
            access_token_expires_at: Utc::now(),
            refresh_token: None,
            refresh_token_expires_at: None,
        };
        let json = serde_json::to_value(&response).unwrap();

        assert!(json.get("accessToken").is_some());
        assert!(json.get("refreshToken").is_none());
        assert!(json.get("refreshTokenExpiresAt").is_none());
    }
}
