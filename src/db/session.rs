/// Session database models and operations
use crate::error::AuthResult;
use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, Sqlite};

/// Session record in the database
///
/// Only the SHA-256 digest of the refresh token is stored.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: String,
    pub account_id: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_hash: String,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Column changes applied when a refresh token is exchanged
#[derive(Debug)]
pub struct SessionRotation<'a> {
    pub session_id: &'a str,
    /// Digest the session must still hold for the update to apply
    pub expected_refresh_hash: &'a str,
    pub access_token: &'a str,
    pub access_token_expires_at: DateTime<Utc>,
    /// New refresh digest and expiry; `None` leaves both columns untouched
    pub refresh: Option<(&'a str, DateTime<Utc>)>,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub now: DateTime<Utc>,
}

pub async fn insert<'e, E>(executor: E, session: &Session) -> AuthResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO session (id, account_id, access_token, access_token_expires_at,
                              refresh_token_hash, refresh_token_expires_at, ip_address,
                              user_agent, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )
    .bind(&session.id)
    .bind(&session.account_id)
    .bind(&session.access_token)
    .bind(session.access_token_expires_at)
    .bind(&session.refresh_token_hash)
    .bind(session.refresh_token_expires_at)
    .bind(&session.ip_address)
    .bind(&session.user_agent)
    .bind(session.is_active)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn find_by_id<'e, E>(executor: E, id: &str) -> AuthResult<Option<Session>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let session = sqlx::query_as::<_, Session>("SELECT * FROM session WHERE id = ?1")
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(session)
}

/// Active sessions for an account, newest first
pub async fn find_active_for_account<'e, E>(
    executor: E,
    account_id: &str,
) -> AuthResult<Vec<Session>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sessions = sqlx::query_as::<_, Session>(
        "SELECT * FROM session
         WHERE account_id = ?1 AND is_active = 1
         ORDER BY created_at DESC",
    )
    .bind(account_id)
    .fetch_all(executor)
    .await?;

    Ok(sessions)
}

/// Conditionally apply a rotation
///
/// The update lands only while the session is active and still holds
/// `expected_refresh_hash`. Returns the number of rows changed (0 or 1).
pub async fn apply_rotation<'e, E>(executor: E, rotation: &SessionRotation<'_>) -> AuthResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (refresh_hash, refresh_expires_at) = match rotation.refresh {
        Some((hash, expires_at)) => (Some(hash), Some(expires_at)),
        None => (None, None),
    };

    let result = sqlx::query(
        "UPDATE session
         SET access_token = ?1,
             access_token_expires_at = ?2,
             refresh_token_hash = COALESCE(?3, refresh_token_hash),
             refresh_token_expires_at = COALESCE(?4, refresh_token_expires_at),
             ip_address = COALESCE(?5, ip_address),
             user_agent = COALESCE(?6, user_agent),
             updated_at = ?7
         WHERE id = ?8 AND is_active = 1 AND refresh_token_hash = ?9",
    )
    .bind(rotation.access_token)
    .bind(rotation.access_token_expires_at)
    .bind(refresh_hash)
    .bind(refresh_expires_at)
    .bind(rotation.ip_address)
    .bind(rotation.user_agent)
    .bind(rotation.now)
    .bind(rotation.session_id)
    .bind(rotation.expected_refresh_hash)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Deactivate one session owned by the account
pub async fn deactivate<'e, E>(
    executor: E,
    session_id: &str,
    account_id: &str,
    now: DateTime<Utc>,
) -> AuthResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE session SET is_active = 0, updated_at = ?1
         WHERE id = ?2 AND account_id = ?3 AND is_active = 1",
    )
    .bind(now)
    .bind(session_id)
    .bind(account_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Deactivate every active session of an account
pub async fn deactivate_all_for_account<'e, E>(
    executor: E,
    account_id: &str,
    now: DateTime<Utc>,
) -> AuthResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE session SET is_active = 0, updated_at = ?1
         WHERE account_id = ?2 AND is_active = 1",
    )
    .bind(now)
    .bind(account_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Deactivate sessions whose refresh token has lapsed
pub async fn deactivate_expired<'e, E>(executor: E, now: DateTime<Utc>) -> AuthResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE session SET is_active = 0, updated_at = ?1
         WHERE is_active = 1 AND refresh_token_expires_at < ?1",
    )
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
