/// Session issuance and refresh-token rotation
use crate::account::tokens::{self, AccessClaims, TokenIssuer};
use crate::db::account::Account;
use crate::db::session::{self, Session, SessionRotation};
use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;
use std::sync::Arc;

pub const ACCESS_TOKEN_TTL_MINUTES: i64 = 15;
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 7;
/// Refresh tokens with less remaining lifetime than this get replaced
pub const REFRESH_ROTATION_THRESHOLD_HOURS: i64 = 24;

/// Where a request came from
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// A newly created session plus the raw refresh token, which is only
/// available at this moment
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub refresh_token: String,
}

/// Outcome of exchanging a refresh token
#[derive(Debug, Clone)]
pub struct RotatedTokens {
    pub session_id: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    /// Present only when the refresh token itself was replaced
    pub refresh_token: Option<String>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

/// Creates, rotates, and ends sessions inside a caller's transaction
pub struct SessionManager {
    issuer: Arc<dyn TokenIssuer>,
}

impl SessionManager {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self { issuer }
    }

    pub fn issuer(&self) -> &dyn TokenIssuer {
        self.issuer.as_ref()
    }

    fn access_token(
        &self,
        account: &Account,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<(String, DateTime<Utc>)> {
        let expires_at = now + Duration::minutes(ACCESS_TOKEN_TTL_MINUTES);
        let claims = AccessClaims {
            sub: account.id.clone(),
            sid: session_id.to_string(),
            role: account.role,
            email: account.email.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        Ok((self.issuer.issue(&claims)?, expires_at))
    }

    /// Create a session for an account that has already passed every check
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        account: &Account,
        provenance: &Provenance,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedSession> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (access_token, access_token_expires_at) =
            self.access_token(account, &session_id, now)?;
        let refresh_token = tokens::generate_opaque_token();

        let record = Session {
            id: session_id,
            account_id: account.id.clone(),
            access_token,
            access_token_expires_at,
            refresh_token_hash: tokens::digest(&refresh_token),
            refresh_token_expires_at: now + Duration::days(REFRESH_TOKEN_TTL_DAYS),
            ip_address: provenance.ip_address.clone(),
            user_agent: provenance.user_agent.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        session::insert(&mut *conn, &record).await?;

        tracing::debug!(account_id = %account.id, session_id = %record.id, "Created session");

        Ok(IssuedSession {
            session: record,
            refresh_token,
        })
    }

    /// Find the active, unexpired session holding this refresh token
    pub async fn find_refreshable(
        &self,
        conn: &mut SqliteConnection,
        account_id: &str,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Session> {
        let presented = tokens::digest(refresh_token);

        let session = session::find_active_for_account(&mut *conn, account_id)
            .await?
            .into_iter()
            .find(|s| tokens::constant_time_eq(&s.refresh_token_hash, &presented))
            .ok_or_else(|| AuthError::Unauthorized("Invalid refresh token".to_string()))?;

        if now >= session.refresh_token_expires_at {
            return Err(AuthError::Unauthorized(
                "Refresh token has expired".to_string(),
            ));
        }

        Ok(session)
    }

    /// Rotate the tokens of a session found by [`Self::find_refreshable`]
    ///
    /// The access token is always replaced. The refresh token is replaced only
    /// when it has under a day left; otherwise its digest and expiry stay as
    /// stored. Losing a race against another rotation is `Unauthorized`.
    pub async fn rotate(
        &self,
        conn: &mut SqliteConnection,
        account: &Account,
        current: &Session,
        provenance: &Provenance,
        now: DateTime<Utc>,
    ) -> AuthResult<RotatedTokens> {
        let (access_token, access_token_expires_at) =
            self.access_token(account, &current.id, now)?;

        let remaining = current.refresh_token_expires_at - now;
        let replacement = if remaining < Duration::hours(REFRESH_ROTATION_THRESHOLD_HOURS) {
            let token = tokens::generate_opaque_token();
            let hash = tokens::digest(&token);
            Some((token, hash, now + Duration::days(REFRESH_TOKEN_TTL_DAYS)))
        } else {
            None
        };

        let rotation = SessionRotation {
            session_id: &current.id,
            expected_refresh_hash: &current.refresh_token_hash,
            access_token: &access_token,
            access_token_expires_at,
            refresh: replacement
                .as_ref()
                .map(|(_, hash, expires_at)| (hash.as_str(), *expires_at)),
            ip_address: provenance.ip_address.as_deref(),
            user_agent: provenance.user_agent.as_deref(),
            now,
        };

        if session::apply_rotation(&mut *conn, &rotation).await? == 0 {
            tracing::warn!(session_id = %current.id, "Refresh token lost a concurrent rotation");
            return Err(AuthError::Unauthorized("Invalid refresh token".to_string()));
        }

        let (refresh_token, refresh_token_expires_at) = match replacement {
            Some((token, _, expires_at)) => (Some(token), Some(expires_at)),
            None => (None, None),
        };

        Ok(RotatedTokens {
            session_id: current.id.clone(),
            access_token,
            access_token_expires_at,
            refresh_token,
            refresh_token_expires_at,
        })
    }

    /// End one session owned by the account
    pub async fn deactivate(
        &self,
        conn: &mut SqliteConnection,
        account_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        if session::deactivate(&mut *conn, session_id, account_id, now).await? == 0 {
            return Err(AuthError::NotFound("Session not found".to_string()));
        }
        Ok(())
    }

    /// End every session of the account, returning how many were active
    pub async fn deactivate_all(
        &self,
        conn: &mut SqliteConnection,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<u64> {
        session::deactivate_all_for_account(&mut *conn, account_id, now).await
    }
}
