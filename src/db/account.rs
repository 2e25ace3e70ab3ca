/// Account database models and operations
use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite};

/// Where an account's credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum IdentityProvider {
    Password,
    Google,
    Apple,
}

/// Account lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AccountStatus {
    Pending,
    Active,
    Suspended,
    Deleted,
    Disabled,
}

impl AccountStatus {
    /// Terminal states that refuse every self-service sign-in path
    pub fn blocks_signin(self) -> bool {
        matches!(
            self,
            AccountStatus::Suspended | AccountStatus::Disabled | AccountStatus::Deleted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Deleted => "deleted",
            AccountStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AccountRole {
    Viewer,
    Creator,
    Admin,
}

/// Account record in the database
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    /// Argon2id PHC string, absent for federated accounts
    pub credential_hash: Option<String>,
    pub identity_provider: IdentityProvider,
    /// Subject id issued by the external identity provider
    pub provider_subject: Option<String>,
    pub status: AccountStatus,
    pub email_verified: bool,
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub verification_token_hash: Option<String>,
    pub verification_token_expires_at: Option<DateTime<Utc>>,
    pub reset_token_hash: Option<String>,
    pub reset_token_expires_at: Option<DateTime<Utc>>,
    pub role: AccountRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Password account awaiting email verification
    pub fn new_password_account(
        email: String,
        full_name: Option<String>,
        credential_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            full_name,
            avatar_url: None,
            credential_hash: Some(credential_hash),
            identity_provider: IdentityProvider::Password,
            provider_subject: None,
            status: AccountStatus::Pending,
            email_verified: false,
            email_confirmed_at: None,
            verification_token_hash: None,
            verification_token_expires_at: None,
            reset_token_hash: None,
            reset_token_expires_at: None,
            role: AccountRole::Viewer,
            created_at: now,
            updated_at: now,
        }
    }

    /// Federated account; the provider vouches for the email
    pub fn new_federated_account(
        provider: IdentityProvider,
        subject: String,
        email: String,
        full_name: Option<String>,
        avatar_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            full_name,
            avatar_url,
            credential_hash: None,
            identity_provider: provider,
            provider_subject: Some(subject),
            status: AccountStatus::Active,
            email_verified: true,
            email_confirmed_at: Some(now),
            verification_token_hash: None,
            verification_token_expires_at: None,
            reset_token_hash: None,
            reset_token_expires_at: None,
            role: AccountRole::Viewer,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Canonical form of an email address: trimmed and lowercased
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Insert a new account
///
/// A unique-constraint rejection on the email index surfaces as `Conflict`.
pub async fn insert<'e, E>(executor: E, account: &Account) -> AuthResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO account (id, email, full_name, avatar_url, credential_hash, identity_provider,
                              provider_subject, status, email_verified, email_confirmed_at,
                              verification_token_hash, verification_token_expires_at,
                              reset_token_hash, reset_token_expires_at, role, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
    )
    .bind(&account.id)
    .bind(&account.email)
    .bind(&account.full_name)
    .bind(&account.avatar_url)
    .bind(&account.credential_hash)
    .bind(account.identity_provider)
    .bind(&account.provider_subject)
    .bind(account.status)
    .bind(account.email_verified)
    .bind(account.email_confirmed_at)
    .bind(&account.verification_token_hash)
    .bind(account.verification_token_expires_at)
    .bind(&account.reset_token_hash)
    .bind(account.reset_token_expires_at)
    .bind(account.role)
    .bind(account.created_at)
    .bind(account.updated_at)
    .execute(executor)
    .await
    .map_err(|e| AuthError::from_unique_violation(e, "Email already in use"))?;

    Ok(())
}

/// Get account by id, whatever its status
pub async fn find_by_id<'e, E>(executor: E, id: &str) -> AuthResult<Option<Account>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let account = sqlx::query_as::<_, Account>("SELECT * FROM account WHERE id = ?1")
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(account)
}

/// Get the live (non-deleted) account for a normalized email
pub async fn find_by_email<'e, E>(executor: E, email: &str) -> AuthResult<Option<Account>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let account = sqlx::query_as::<_, Account>(
        "SELECT * FROM account WHERE email = ?1 AND status != 'deleted'",
    )
    .bind(email)
    .fetch_optional(executor)
    .await?;

    Ok(account)
}

/// Check if a live account holds this normalized email
pub async fn email_exists<'e, E>(executor: E, email: &str) -> AuthResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM account WHERE email = ?1 AND status != 'deleted'",
    )
    .bind(email)
    .fetch_one(executor)
    .await?;

    Ok(count > 0)
}

pub async fn find_by_verification_token_hash<'e, E>(
    executor: E,
    token_hash: &str,
) -> AuthResult<Option<Account>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let account = sqlx::query_as::<_, Account>(
        "SELECT * FROM account WHERE verification_token_hash = ?1",
    )
    .bind(token_hash)
    .fetch_optional(executor)
    .await?;

    Ok(account)
}

pub async fn find_by_reset_token_hash<'e, E>(
    executor: E,
    token_hash: &str,
) -> AuthResult<Option<Account>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let account =
        sqlx::query_as::<_, Account>("SELECT * FROM account WHERE reset_token_hash = ?1")
            .bind(token_hash)
            .fetch_optional(executor)
            .await?;

    Ok(account)
}

/// Store a verification digest, superseding any outstanding one
pub async fn set_verification_token<'e, E>(
    executor: E,
    account_id: &str,
    token_hash: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> AuthResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE account
         SET verification_token_hash = ?1, verification_token_expires_at = ?2, updated_at = ?3
         WHERE id = ?4",
    )
    .bind(token_hash)
    .bind(expires_at)
    .bind(now)
    .bind(account_id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AuthError::NotFound("Account not found".to_string()));
    }

    Ok(())
}

/// Flip a pending account to active and consume its verification digest
///
/// Returns false when the digest was consumed or replaced concurrently.
pub async fn mark_email_verified<'e, E>(
    executor: E,
    account_id: &str,
    token_hash: &str,
    now: DateTime<Utc>,
) -> AuthResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE account
         SET status = 'active',
             email_verified = 1,
             email_confirmed_at = ?1,
             verification_token_hash = NULL,
             verification_token_expires_at = NULL,
             updated_at = ?1
         WHERE id = ?2 AND verification_token_hash = ?3 AND status = 'pending'",
    )
    .bind(now)
    .bind(account_id)
    .bind(token_hash)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Store a password-reset digest, superseding any outstanding one
pub async fn set_reset_token<'e, E>(
    executor: E,
    account_id: &str,
    token_hash: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> AuthResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE account
         SET reset_token_hash = ?1, reset_token_expires_at = ?2, updated_at = ?3
         WHERE id = ?4",
    )
    .bind(token_hash)
    .bind(expires_at)
    .bind(now)
    .bind(account_id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AuthError::NotFound("Account not found".to_string()));
    }

    Ok(())
}

/// Replace the credential hash and consume the reset digest
///
/// Returns false when the digest was consumed or replaced concurrently.
pub async fn replace_credential<'e, E>(
    executor: E,
    account_id: &str,
    reset_token_hash: &str,
    credential_hash: &str,
    now: DateTime<Utc>,
) -> AuthResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE account
         SET credential_hash = ?1,
             reset_token_hash = NULL,
             reset_token_expires_at = NULL,
             updated_at = ?2
         WHERE id = ?3 AND reset_token_hash = ?4",
    )
    .bind(credential_hash)
    .bind(now)
    .bind(account_id)
    .bind(reset_token_hash)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Drop verification and reset digests whose expiry has passed
///
/// Returns the number of accounts touched.
pub async fn clear_expired_tokens<'e, E>(executor: E, now: DateTime<Utc>) -> AuthResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE account
         SET verification_token_hash = CASE
                 WHEN verification_token_expires_at < ?1 THEN NULL
                 ELSE verification_token_hash END,
             verification_token_expires_at = CASE
                 WHEN verification_token_expires_at < ?1 THEN NULL
                 ELSE verification_token_expires_at END,
             reset_token_hash = CASE
                 WHEN reset_token_expires_at < ?1 THEN NULL
                 ELSE reset_token_hash END,
             reset_token_expires_at = CASE
                 WHEN reset_token_expires_at < ?1 THEN NULL
                 ELSE reset_token_expires_at END,
             updated_at = ?1
         WHERE verification_token_expires_at < ?1 OR reset_token_expires_at < ?1",
    )
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
