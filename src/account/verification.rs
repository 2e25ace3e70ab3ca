/// Email verification workflow
use crate::account::tokens;
use crate::db::account::{self, Account, AccountStatus};
use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

/// How long a verification link stays usable
pub const VERIFICATION_TOKEN_TTL_HOURS: i64 = 24;

/// Issue a fresh verification token, superseding any outstanding one
///
/// Returns the raw token for delivery; only its digest is stored.
pub async fn issue(
    conn: &mut SqliteConnection,
    account_id: &str,
    now: DateTime<Utc>,
) -> AuthResult<String> {
    let token = tokens::generate_opaque_token();
    account::set_verification_token(
        &mut *conn,
        account_id,
        &tokens::digest(&token),
        now + Duration::hours(VERIFICATION_TOKEN_TTL_HOURS),
        now,
    )
    .await?;

    Ok(token)
}

/// Consume a verification token and activate the account
pub async fn complete(
    conn: &mut SqliteConnection,
    raw_token: &str,
    now: DateTime<Utc>,
) -> AuthResult<Account> {
    let token_hash = tokens::digest(raw_token);

    let pending = account::find_by_verification_token_hash(&mut *conn, &token_hash)
        .await?
        .ok_or_else(|| AuthError::NotFound("Invalid or expired verification link".to_string()))?;

    match pending.verification_token_expires_at {
        Some(expires_at) if now < expires_at => {}
        _ => {
            return Err(AuthError::Unauthorized(
                "Verification link has expired".to_string(),
            ))
        }
    }

    if pending.status != AccountStatus::Pending {
        return Err(AuthError::Forbidden(format!(
            "Account cannot be verified while {}",
            pending.status.as_str()
        )));
    }

    if !account::mark_email_verified(&mut *conn, &pending.id, &token_hash, now).await? {
        return Err(AuthError::NotFound(
            "Invalid or expired verification link".to_string(),
        ));
    }

    account::find_by_id(&mut *conn, &pending.id)
        .await?
        .ok_or_else(|| AuthError::Internal("Verified account disappeared".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    async fn seed(conn: &mut SqliteConnection) -> Account {
        let account = Account::new_password_account(
            "ada@example.com".to_string(),
            None,
            "$argon2id$fake".to_string(),
            Utc::now(),
        );
        account::insert(&mut *conn, &account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_reissue_supersedes_previous_token() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let account = seed(&mut conn).await;
        let now = Utc::now();

        let first = issue(&mut conn, &account.id, now).await.unwrap();
        let second = issue(&mut conn, &account.id, now).await.unwrap();

        assert!(matches!(
            complete(&mut conn, &first, now).await,
            Err(AuthError::NotFound(_))
        ));
        let verified = complete(&mut conn, &second, now).await.unwrap();
        assert_eq!(verified.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_exclusive() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let account = seed(&mut conn).await;
        let now = Utc::now();

        let token = issue(&mut conn, &account.id, now).await.unwrap();
        match complete(&mut conn, &token, now + Duration::hours(VERIFICATION_TOKEN_TTL_HOURS)).await {
            Err(AuthError::Unauthorized(msg)) => assert_eq!(msg, "Verification link has expired"),
            other => panic!("Expected Unauthorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_account_cannot_verify() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let account = seed(&mut conn).await;
        let now = Utc::now();
        let token = issue(&mut conn, &account.id, now).await.unwrap();

        sqlx::query("UPDATE account SET status = 'suspended' WHERE id = ?1")
            .bind(&account.id)
            .execute(&mut *conn)
            .await
            .unwrap();

        assert!(matches!(
            complete(&mut conn, &token, now).await,
            Err(AuthError::Forbidden(_))
        ));
    }
}
