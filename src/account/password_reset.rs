/// Password reset workflow
use crate::account::tokens;
use crate::db::account::{self, Account};
use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

/// How long a reset link stays usable
pub const RESET_TOKEN_TTL_MINUTES: i64 = 15;

/// Issue a fresh reset token, superseding any outstanding one
pub async fn issue(
    conn: &mut SqliteConnection,
    account_id: &str,
    now: DateTime<Utc>,
) -> AuthResult<String> {
    let token = tokens::generate_opaque_token();
    account::set_reset_token(
        &mut *conn,
        account_id,
        &tokens::digest(&token),
        now + Duration::minutes(RESET_TOKEN_TTL_MINUTES),
        now,
    )
    .await?;

    Ok(token)
}

/// Consume a reset token and store the new credential hash
///
/// The caller derives `credential_hash` before opening the transaction.
pub async fn complete(
    conn: &mut SqliteConnection,
    raw_token: &str,
    credential_hash: &str,
    now: DateTime<Utc>,
) -> AuthResult<Account> {
    let token_hash = tokens::digest(raw_token);

    let target = account::find_by_reset_token_hash(&mut *conn, &token_hash)
        .await?
        .ok_or_else(|| AuthError::NotFound("Invalid or expired reset link".to_string()))?;

    match target.reset_token_expires_at {
        Some(expires_at) if now < expires_at => {}
        _ => return Err(AuthError::Unauthorized("Reset link has expired".to_string())),
    }

    // Links issued before a suspension must not reopen the account
    if target.status.blocks_signin() {
        return Err(AuthError::Forbidden(format!(
            "Account has been {}. Contact support.",
            target.status.as_str()
        )));
    }

    if !account::replace_credential(&mut *conn, &target.id, &token_hash, credential_hash, now)
        .await?
    {
        return Err(AuthError::NotFound("Invalid or expired reset link".to_string()));
    }

    Ok(target)
}
