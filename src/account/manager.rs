/// Account manager: composes credential checks, workflows, and sessions
/// into the public authentication flows
///
/// Password hashing and email delivery always run outside write
/// transactions; each flow holds the writer only for its database work.

use crate::{
    account::{
        password::CredentialHasher,
        password_reset,
        session::{IssuedSession, Provenance, RotatedTokens, SessionManager},
        tokens::{self, TokenIssuer},
        validate_request, verification, GoogleSigninRequest, RefreshTokenRequest,
        RequestPasswordResetRequest, ResetPasswordRequest, SigninRequest, SignupRequest,
        ValidatedSession,
    },
    clock::Clock,
    config::ServerConfig,
    db::{
        account::{self, normalize_email, Account, IdentityProvider},
        session::{self, Session},
        TransactionCoordinator,
    },
    error::{AuthError, AuthResult},
    identity::ExternalIdentityVerifier,
    mailer::MailSender,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

const INVALID_CREDENTIALS: &str = "Invalid email or password";
const UNVERIFIED_EMAIL: &str =
    "Email not verified. A new verification link has been sent to your email.";
const PASSWORD_ACCOUNT_EXISTS: &str =
    "This email is already registered with a password. Please sign in using email and password.";

/// Services the manager delegates to
pub struct Collaborators {
    pub token_issuer: Arc<dyn TokenIssuer>,
    pub hasher: CredentialHasher,
    pub mailer: Arc<dyn MailSender>,
    pub identity_verifier: Arc<dyn ExternalIdentityVerifier>,
    pub clock: Arc<dyn Clock>,
}

/// Result of any flow that ends in a new session
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub account: Account,
    pub session: IssuedSession,
}

/// Account manager service
pub struct AccountManager {
    db: SqlitePool,
    transactions: TransactionCoordinator,
    sessions: SessionManager,
    hasher: CredentialHasher,
    mailer: Arc<dyn MailSender>,
    identity_verifier: Arc<dyn ExternalIdentityVerifier>,
    clock: Arc<dyn Clock>,
    external_timeout: Duration,
}

fn ensure_signin_allowed(account: &Account) -> AuthResult<()> {
    if account.status.blocks_signin() {
        return Err(AuthError::Forbidden(format!(
            "Account has been {}. Contact support.",
            account.status.as_str()
        )));
    }
    Ok(())
}

impl AccountManager {
    pub fn new(db: SqlitePool, config: &ServerConfig, collaborators: Collaborators) -> Self {
        let external_timeout = config.timeouts.external();

        Self {
            transactions: TransactionCoordinator::new(db.clone(), external_timeout),
            db,
            sessions: SessionManager::new(collaborators.token_issuer),
            hasher: collaborators.hasher,
            mailer: collaborators.mailer,
            identity_verifier: collaborators.identity_verifier,
            clock: collaborators.clock,
            external_timeout,
        }
    }

    /// Create a password account awaiting email verification
    ///
    /// The account and its verification token commit together; the email goes
    /// out afterwards and a delivery failure does not undo the signup.
    pub async fn signup(&self, request: SignupRequest) -> AuthResult<Account> {
        let request = SignupRequest {
            email: normalize_email(&request.email),
            password: request.password,
            full_name: request
                .full_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
        };
        validate_request(&request)?;

        // Fast path only; the unique index decides races
        if account::email_exists(&self.db, &request.email).await? {
            return Err(AuthError::Conflict("Email already in use".to_string()));
        }

        let credential_hash = self.hasher.hash(&request.password).await?;
        let now = self.clock.now();
        let created = Account::new_password_account(
            request.email,
            request.full_name,
            credential_hash,
            now,
        );

        let mut tx = self.transactions.begin().await?;
        account::insert(&mut *tx, &created).await?;
        let token = verification::issue(&mut tx, &created.id, now).await?;
        tx.commit().await?;

        tracing::info!(account_id = %created.id, "Created account");
        self.dispatch_verification_email(&created, &token).await;

        Ok(created)
    }

    /// Password sign-in
    pub async fn signin(
        &self,
        request: SigninRequest,
        provenance: Provenance,
    ) -> AuthResult<SignedIn> {
        let request = SigninRequest {
            email: normalize_email(&request.email),
            password: request.password,
        };
        validate_request(&request)?;

        let found = account::find_by_email(&self.db, &request.email).await?;
        let (found, stored_hash) = match found {
            Some(acct) => match acct.credential_hash.clone() {
                Some(hash) => (acct, hash),
                None => {
                    self.hasher.verify_dummy(&request.password).await;
                    return Err(AuthError::Unauthorized(INVALID_CREDENTIALS.to_string()));
                }
            },
            None => {
                self.hasher.verify_dummy(&request.password).await;
                return Err(AuthError::Unauthorized(INVALID_CREDENTIALS.to_string()));
            }
        };

        if !self.hasher.verify(&request.password, &stored_hash).await? {
            tracing::debug!(account_id = %found.id, "Password mismatch");
            return Err(AuthError::Unauthorized(INVALID_CREDENTIALS.to_string()));
        }

        ensure_signin_allowed(&found)?;

        let now = self.clock.now();

        if !found.email_verified {
            let mut tx = self.transactions.begin().await?;
            let token = verification::issue(&mut tx, &found.id, now).await?;
            tx.commit().await?;

            tracing::info!(account_id = %found.id, "Sign-in blocked on unverified email, resent link");
            self.dispatch_verification_email(&found, &token).await;
            return Err(AuthError::Forbidden(UNVERIFIED_EMAIL.to_string()));
        }

        let mut tx = self.transactions.begin().await?;
        let issued = self.sessions.create(&mut tx, &found, &provenance, now).await?;
        tx.commit().await?;

        tracing::info!(account_id = %found.id, session_id = %issued.session.id, "Signed in");

        Ok(SignedIn {
            account: found,
            session: issued,
        })
    }

    /// Google sign-in, provisioning the account on first use
    pub async fn signin_with_google(
        &self,
        request: GoogleSigninRequest,
        provenance: Provenance,
    ) -> AuthResult<SignedIn> {
        let request = GoogleSigninRequest {
            id_token: request.id_token.trim().to_string(),
        };
        validate_request(&request)?;

        let identity = tokio::time::timeout(
            self.external_timeout,
            self.identity_verifier.verify(&request.id_token),
        )
        .await
        .map_err(|_| AuthError::Unauthorized("Unable to verify Google token".to_string()))??;

        let email = normalize_email(&identity.email);
        let now = self.clock.now();

        let mut tx = self.transactions.begin().await?;
        let signed_in_account = match account::find_by_email(&mut *tx, &email).await? {
            Some(existing) => {
                match existing.identity_provider {
                    IdentityProvider::Google => {}
                    IdentityProvider::Password => {
                        return Err(AuthError::Conflict(PASSWORD_ACCOUNT_EXISTS.to_string()))
                    }
                    IdentityProvider::Apple => {
                        return Err(AuthError::Conflict(
                            "This email is already registered with another sign-in provider."
                                .to_string(),
                        ))
                    }
                }

                if let Some(subject) = existing.provider_subject.as_deref() {
                    if subject != identity.subject {
                        return Err(AuthError::Conflict(
                            "This email is linked to a different Google account.".to_string(),
                        ));
                    }
                }

                ensure_signin_allowed(&existing)?;
                existing
            }
            None => {
                let provisioned = Account::new_federated_account(
                    identity.provider,
                    identity.subject,
                    email,
                    Some(
                        identity
                            .full_name
                            .unwrap_or_else(|| "Unnamed User".to_string()),
                    ),
                    identity.avatar_url,
                    now,
                );
                account::insert(&mut *tx, &provisioned).await?;
                tracing::info!(account_id = %provisioned.id, "Provisioned Google account");
                provisioned
            }
        };

        let issued = self
            .sessions
            .create(&mut tx, &signed_in_account, &provenance, now)
            .await?;
        tx.commit().await?;

        Ok(SignedIn {
            account: signed_in_account,
            session: issued,
        })
    }

    /// Consume a verification token, activate the account, and sign it in
    pub async fn verify_email(&self, token: &str, provenance: Provenance) -> AuthResult<SignedIn> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Validation(
                "Verification token is required".to_string(),
            ));
        }

        let now = self.clock.now();
        let mut tx = self.transactions.begin().await?;
        let verified = verification::complete(&mut tx, token, now).await?;
        let issued = self.sessions.create(&mut tx, &verified, &provenance, now).await?;
        tx.commit().await?;

        tracing::info!(account_id = %verified.id, "Email verified");

        Ok(SignedIn {
            account: verified,
            session: issued,
        })
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(
        &self,
        request: RefreshTokenRequest,
        provenance: Provenance,
    ) -> AuthResult<RotatedTokens> {
        validate_request(&request)?;

        let now = self.clock.now();
        let mut tx = self.transactions.begin().await?;

        let owner = account::find_by_id(&mut *tx, &request.user_id)
            .await?
            .ok_or_else(|| AuthError::Unauthorized("Invalid refresh token".to_string()))?;
        let current = self
            .sessions
            .find_refreshable(&mut tx, &owner.id, &request.refresh_token, now)
            .await?;
        // Status is only revealed to holders of a valid refresh token
        ensure_signin_allowed(&owner)?;

        let rotated = self
            .sessions
            .rotate(&mut tx, &owner, &current, &provenance, now)
            .await?;
        tx.commit().await?;

        tracing::debug!(
            session_id = %rotated.session_id,
            refresh_rotated = rotated.refresh_token.is_some(),
            "Refreshed session"
        );

        Ok(rotated)
    }

    /// Start a password reset
    ///
    /// Unknown emails and accounts without a password get the same silent
    /// success as real ones, so the response never reveals which exist.
    pub async fn request_password_reset(
        &self,
        request: RequestPasswordResetRequest,
    ) -> AuthResult<()> {
        let request = RequestPasswordResetRequest {
            email: normalize_email(&request.email),
        };
        validate_request(&request)?;

        let target = match account::find_by_email(&self.db, &request.email).await? {
            Some(found) if found.credential_hash.is_some() && !found.status.blocks_signin() => {
                found
            }
            Some(found) => {
                tracing::debug!(account_id = %found.id, "Password reset not applicable");
                return Ok(());
            }
            None => {
                tracing::debug!("Password reset requested for unknown email");
                return Ok(());
            }
        };

        let now = self.clock.now();
        let mut tx = self.transactions.begin().await?;
        let token = password_reset::issue(&mut tx, &target.id, now).await?;
        tx.commit().await?;

        tracing::info!(account_id = %target.id, "Issued password reset token");
        self.dispatch_password_reset_email(&target, &token).await;

        Ok(())
    }

    /// Finish a password reset and end every existing session
    pub async fn reset_password(&self, request: ResetPasswordRequest) -> AuthResult<()> {
        let request = ResetPasswordRequest {
            token: request.token.trim().to_string(),
            new_password: request.new_password,
        };
        validate_request(&request)?;

        let credential_hash = self.hasher.hash(&request.new_password).await?;
        let now = self.clock.now();

        let mut tx = self.transactions.begin().await?;
        let target =
            password_reset::complete(&mut tx, &request.token, &credential_hash, now).await?;
        let ended = self.sessions.deactivate_all(&mut tx, &target.id, now).await?;
        tx.commit().await?;

        tracing::info!(account_id = %target.id, sessions_ended = ended, "Password reset");
        Ok(())
    }

    /// Resolve a bearer access token to its live session
    pub async fn authenticate(&self, access_token: &str) -> AuthResult<ValidatedSession> {
        let claims = self.sessions.issuer().verify(access_token)?;

        let current = session::find_by_id(&self.db, &claims.sid)
            .await?
            .filter(|s| s.is_active && s.account_id == claims.sub)
            .ok_or_else(|| AuthError::Unauthorized("Session is no longer active".to_string()))?;

        // Refresh replaces the stored access token, retiring the previous one
        if !tokens::constant_time_eq(&current.access_token, access_token) {
            return Err(AuthError::Unauthorized("Access token has been superseded".to_string()));
        }
        if self.clock.now() >= current.access_token_expires_at {
            return Err(AuthError::Unauthorized("Access token has expired".to_string()));
        }

        let owner = account::find_by_id(&self.db, &claims.sub)
            .await?
            .ok_or_else(|| AuthError::Unauthorized("Account not found".to_string()))?;
        ensure_signin_allowed(&owner)?;

        Ok(ValidatedSession {
            account_id: owner.id,
            session_id: current.id,
            email: owner.email,
            role: owner.role,
        })
    }

    /// End the caller's session
    pub async fn signout(&self, caller: &ValidatedSession) -> AuthResult<()> {
        let now = self.clock.now();
        let mut tx = self.transactions.begin().await?;
        self.sessions
            .deactivate(&mut tx, &caller.account_id, &caller.session_id, now)
            .await?;
        tx.commit().await?;

        tracing::info!(account_id = %caller.account_id, session_id = %caller.session_id, "Signed out");
        Ok(())
    }

    /// Active sessions of the caller's account
    pub async fn list_sessions(&self, caller: &ValidatedSession) -> AuthResult<Vec<Session>> {
        session::find_active_for_account(&self.db, &caller.account_id).await
    }

    /// Deactivate lapsed sessions and drop expired one-time tokens
    ///
    /// Returns (sessions deactivated, accounts with tokens cleared).
    pub async fn sweep_expired(&self) -> AuthResult<(u64, u64)> {
        let now = self.clock.now();
        let mut tx = self.transactions.begin().await?;
        let sessions_ended = session::deactivate_expired(&mut *tx, now).await?;
        let tokens_cleared = account::clear_expired_tokens(&mut *tx, now).await?;
        tx.commit().await?;

        if sessions_ended > 0 || tokens_cleared > 0 {
            tracing::info!(sessions_ended, tokens_cleared, "Swept expired sessions and tokens");
        } else {
            tracing::debug!("Expiry sweep: nothing to do");
        }

        Ok((sessions_ended, tokens_cleared))
    }

    async fn dispatch_verification_email(&self, recipient: &Account, token: &str) {
        let send = self.mailer.send_verification_email(
            &recipient.email,
            recipient.full_name.as_deref(),
            token,
        );

        match tokio::time::timeout(self.external_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(account_id = %recipient.id, error = %e, "Failed to send verification email")
            }
            Err(_) => {
                tracing::warn!(account_id = %recipient.id, "Timed out sending verification email")
            }
        }
    }

    async fn dispatch_password_reset_email(&self, recipient: &Account, token: &str) {
        let send = self.mailer.send_password_reset_email(
            &recipient.email,
            recipient.full_name.as_deref(),
            token,
        );

        match tokio::time::timeout(self.external_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(account_id = %recipient.id, error = %e, "Failed to send password reset email")
            }
            Err(_) => {
                tracing::warn!(account_id = %recipient.id, "Timed out sending password reset email")
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::account::password::test_hasher;
    use crate::account::session::{ACCESS_TOKEN_TTL_MINUTES, REFRESH_TOKEN_TTL_DAYS};
    use crate::account::tokens::JwtTokenIssuer;
    use crate::clock::ManualClock;
    use crate::config::test_config;
    use crate::db::account::AccountStatus;
    use crate::db::test_pool;
    use crate::identity::StaticIdentityVerifier;
    use crate::mailer::{RecordingMailer, SentMail};
    use chrono::{Duration as ChronoDuration, Utc};

    pub(crate) struct Harness {
        pub manager: Arc<AccountManager>,
        pub mailer: Arc<RecordingMailer>,
        pub clock: Arc<ManualClock>,
        pub db: SqlitePool,
    }

    pub(crate) async fn harness() -> Harness {
        let db = test_pool().await;
        let config = test_config();
        let mailer = Arc::new(RecordingMailer::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let verifier = StaticIdentityVerifier::new()
            .with_google("google-grace", "g-100", "Grace@Example.com", Some("Grace Hopper"))
            .with_google("google-ada", "g-200", "ada@example.com", None)
            .with_google("google-nameless", "g-300", "nameless@example.com", None);

        let collaborators = Collaborators {
            token_issuer: Arc::new(JwtTokenIssuer::new(&config.authentication.jwt_secret)),
            hasher: test_hasher(),
            mailer: mailer.clone(),
            identity_verifier: Arc::new(verifier),
            clock: clock.clone(),
        };

        Harness {
            manager: Arc::new(AccountManager::new(db.clone(), &config, collaborators)),
            mailer,
            clock,
            db,
        }
    }

    pub(crate) fn signup_request(email: &str, password: &str) -> SignupRequest {
        SignupRequest {
            email: email.to_string(),
            password: password.to_string(),
            full_name: Some("Ada Lovelace".to_string()),
        }
    }

    fn signin_request(email: &str, password: &str) -> SigninRequest {
        SigninRequest {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    /// Sign up, follow the emailed link, and return the resulting session
    pub(crate) async fn verified_account(h: &Harness, email: &str, password: &str) -> SignedIn {
        h.manager.signup(signup_request(email, password)).await.unwrap();
        let token = h.mailer.last_verification_token(&normalize_email(email)).unwrap();
        h.manager
            .verify_email(&token, Provenance::default())
            .await
            .unwrap()
    }

    async fn set_status(db: &SqlitePool, account_id: &str, status: AccountStatus) {
        sqlx::query("UPDATE account SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(account_id)
            .execute(db)
            .await
            .unwrap();
    }

    async fn raw_refresh_columns(db: &SqlitePool, session_id: &str) -> (String, String) {
        sqlx::query_as(
            "SELECT refresh_token_hash, CAST(refresh_token_expires_at AS TEXT) FROM session WHERE id = ?1",
        )
        .bind(session_id)
        .fetch_one(db)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_signup_creates_pending_account() {
        let h = harness().await;
        let created = h
            .manager
            .signup(signup_request("  Ada@Example.COM ", "password123"))
            .await
            .unwrap();

        assert_eq!(created.email, "ada@example.com");
        assert_eq!(created.status, AccountStatus::Pending);
        assert!(!created.email_verified);

        let stored = account::find_by_id(&h.db, &created.id).await.unwrap().unwrap();
        let stored_hash = stored.credential_hash.unwrap();
        assert!(stored_hash.starts_with("$argon2id$"));
        assert!(!stored_hash.contains("password123"));

        // Only the digest of the emailed token is persisted
        let token = h.mailer.last_verification_token("ada@example.com").unwrap();
        assert_eq!(stored.verification_token_hash, Some(tokens::digest(&token)));
        assert_eq!(
            stored.verification_token_expires_at,
            Some(h.clock.now() + ChronoDuration::hours(24))
        );
    }

    #[tokio::test]
    async fn test_signup_duplicate_email_any_case() {
        let h = harness().await;
        h.manager
            .signup(signup_request("ada@example.com", "password123"))
            .await
            .unwrap();

        match h
            .manager
            .signup(signup_request("ADA@example.com", "password456"))
            .await
        {
            Err(AuthError::Conflict(msg)) => assert_eq!(msg, "Email already in use"),
            other => panic!("Expected Conflict error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signup_rejects_invalid_input() {
        let h = harness().await;

        assert!(matches!(
            h.manager.signup(signup_request("not-an-email", "password123")).await,
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            h.manager.signup(signup_request("ada@example.com", "short")).await,
            Err(AuthError::Validation(_))
        ));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_signups_single_winner() {
        let h = harness().await;
        let mut handles = Vec::new();

        for i in 0..8 {
            let manager = Arc::clone(&h.manager);
            let email = if i % 2 == 0 { "race@example.com" } else { "RACE@example.com" };
            handles.push(tokio::spawn(async move {
                manager.signup(signup_request(email, "password123")).await
            }));
        }

        let mut created = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(AuthError::Conflict(_)) => conflicts += 1,
                Err(other) => panic!("Unexpected error: {:?}", other),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(conflicts, 7);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM account WHERE email = ?1")
            .bind("race@example.com")
            .fetch_one(&h.db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_signup_survives_mail_failure() {
        let h = harness().await;
        h.mailer.fail_sends();

        let created = h
            .manager
            .signup(signup_request("ada@example.com", "password123"))
            .await
            .unwrap();

        assert!(account::find_by_id(&h.db, &created.id).await.unwrap().is_some());
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_signup_verify_signin_scenario() {
        let h = harness().await;
        h.manager
            .signup(signup_request("a@x.com", "password1"))
            .await
            .unwrap();
        let token = h.mailer.last_verification_token("a@x.com").unwrap();

        let verified = h
            .manager
            .verify_email(&token, Provenance::default())
            .await
            .unwrap();
        assert_eq!(verified.account.status, AccountStatus::Active);
        assert!(verified.account.email_verified);
        assert!(verified.account.email_confirmed_at.is_some());

        // Token is single-use
        assert!(matches!(
            h.manager.verify_email(&token, Provenance::default()).await,
            Err(AuthError::NotFound(_))
        ));

        let signed_in = h
            .manager
            .signin(signin_request("a@x.com", "password1"), Provenance::default())
            .await
            .unwrap();
        assert_eq!(signed_in.account.id, verified.account.id);
        assert_ne!(signed_in.session.session.id, verified.session.session.id);
    }

    #[tokio::test]
    async fn test_verify_expired_token() {
        let h = harness().await;
        h.manager
            .signup(signup_request("ada@example.com", "password123"))
            .await
            .unwrap();
        let token = h.mailer.last_verification_token("ada@example.com").unwrap();

        h.clock.advance(ChronoDuration::hours(24) + ChronoDuration::seconds(1));

        match h.manager.verify_email(&token, Provenance::default()).await {
            Err(AuthError::Unauthorized(msg)) => assert_eq!(msg, "Verification link has expired"),
            other => panic!("Expected Unauthorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_verify_unknown_token() {
        let h = harness().await;
        assert!(matches!(
            h.manager.verify_email("deadbeef", Provenance::default()).await,
            Err(AuthError::NotFound(_))
        ));
        assert!(matches!(
            h.manager.verify_email("  ", Provenance::default()).await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_signin_bad_credentials_share_message() {
        let h = harness().await;
        verified_account(&h, "ada@example.com", "password123").await;

        let wrong_password = h
            .manager
            .signin(signin_request("ada@example.com", "password999"), Provenance::default())
            .await;
        let unknown_email = h
            .manager
            .signin(signin_request("nobody@example.com", "password123"), Provenance::default())
            .await;

        for result in [wrong_password, unknown_email] {
            match result {
                Err(AuthError::Unauthorized(msg)) => assert_eq!(msg, INVALID_CREDENTIALS),
                other => panic!("Expected Unauthorized, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unverified_signin_resends_without_session() {
        let h = harness().await;
        let created = h
            .manager
            .signup(signup_request("ada@example.com", "password123"))
            .await
            .unwrap();
        let first_token = h.mailer.last_verification_token("ada@example.com").unwrap();

        match h
            .manager
            .signin(signin_request("ada@example.com", "password123"), Provenance::default())
            .await
        {
            Err(AuthError::Forbidden(msg)) => assert_eq!(msg, UNVERIFIED_EMAIL),
            other => panic!("Expected Forbidden, got {:?}", other),
        }

        let session_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM session WHERE account_id = ?1")
            .bind(&created.id)
            .fetch_one(&h.db)
            .await
            .unwrap();
        assert_eq!(session_count, 0);

        let verification_mails = h
            .mailer
            .sent()
            .into_iter()
            .filter(|m| matches!(m, SentMail::Verification { .. }))
            .count();
        assert_eq!(verification_mails, 2);

        // The resend supersedes the original link
        let second_token = h.mailer.last_verification_token("ada@example.com").unwrap();
        assert_ne!(first_token, second_token);
        assert!(matches!(
            h.manager.verify_email(&first_token, Provenance::default()).await,
            Err(AuthError::NotFound(_))
        ));
        h.manager
            .verify_email(&second_token, Provenance::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocked_accounts_are_forbidden() {
        let h = harness().await;
        let signed_in = verified_account(&h, "ada@example.com", "password123").await;

        for status in [AccountStatus::Suspended, AccountStatus::Disabled] {
            set_status(&h.db, &signed_in.account.id, status).await;

            match h
                .manager
                .signin(signin_request("ada@example.com", "password123"), Provenance::default())
                .await
            {
                Err(AuthError::Forbidden(msg)) => assert!(msg.contains(status.as_str())),
                other => panic!("Expected Forbidden, got {:?}", other),
            }

            let refresh = h
                .manager
                .refresh(
                    RefreshTokenRequest {
                        user_id: signed_in.account.id.clone(),
                        refresh_token: signed_in.session.refresh_token.clone(),
                    },
                    Provenance::default(),
                )
                .await;
            assert!(matches!(refresh, Err(AuthError::Forbidden(_))));
        }
    }

    #[tokio::test]
    async fn test_refresh_hides_status_from_invalid_token() {
        let h = harness().await;
        let signed_in = verified_account(&h, "ada@example.com", "password123").await;
        set_status(&h.db, &signed_in.account.id, AccountStatus::Suspended).await;

        let refresh = h
            .manager
            .refresh(
                RefreshTokenRequest {
                    user_id: signed_in.account.id.clone(),
                    refresh_token: "garbage".to_string(),
                },
                Provenance::default(),
            )
            .await;
        assert!(matches!(refresh, Err(AuthError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_blocked_google_account_is_forbidden() {
        let h = harness().await;
        let request = GoogleSigninRequest {
            id_token: "google-grace".to_string(),
        };
        let first = h
            .manager
            .signin_with_google(request.clone(), Provenance::default())
            .await
            .unwrap();

        for status in [AccountStatus::Suspended, AccountStatus::Disabled] {
            set_status(&h.db, &first.account.id, status).await;

            match h
                .manager
                .signin_with_google(request.clone(), Provenance::default())
                .await
            {
                Err(AuthError::Forbidden(msg)) => assert!(msg.contains(status.as_str())),
                other => panic!("Expected Forbidden, got {:?}", other.map(|s| s.account.id)),
            }
        }

        let active = session::find_active_for_account(&h.db, &first.account.id)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_google_signin_single_account() {
        let h = harness().await;
        let mut handles = Vec::new();

        for _ in 0..6 {
            let manager = Arc::clone(&h.manager);
            handles.push(tokio::spawn(async move {
                manager
                    .signin_with_google(
                        GoogleSigninRequest {
                            id_token: "google-grace".to_string(),
                        },
                        Provenance::default(),
                    )
                    .await
            }));
        }

        let mut account_ids = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(signed_in) => account_ids.push(signed_in.account.id),
                Err(AuthError::Conflict(_)) => {}
                Err(other) => panic!("Unexpected error: {:?}", other),
            }
        }

        assert!(!account_ids.is_empty());
        assert!(account_ids.iter().all(|id| id == &account_ids[0]));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM account WHERE email = ?1")
            .bind("grace@example.com")
            .fetch_one(&h.db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_google_signin_provisions_then_reuses() {
        let h = harness().await;
        let request = GoogleSigninRequest {
            id_token: "google-grace".to_string(),
        };

        let first = h
            .manager
            .signin_with_google(request.clone(), Provenance::default())
            .await
            .unwrap();
        assert_eq!(first.account.email, "grace@example.com");
        assert_eq!(first.account.identity_provider, IdentityProvider::Google);
        assert_eq!(first.account.status, AccountStatus::Active);
        assert!(first.account.email_verified);
        assert!(first.account.credential_hash.is_none());
        assert_eq!(first.account.full_name.as_deref(), Some("Grace Hopper"));

        let second = h
            .manager
            .signin_with_google(request, Provenance::default())
            .await
            .unwrap();
        assert_eq!(second.account.id, first.account.id);
        assert_ne!(second.session.session.id, first.session.session.id);
    }

    #[tokio::test]
    async fn test_google_signin_default_name() {
        let h = harness().await;
        let signed_in = h
            .manager
            .signin_with_google(
                GoogleSigninRequest {
                    id_token: "google-nameless".to_string(),
                },
                Provenance::default(),
            )
            .await
            .unwrap();
        assert_eq!(signed_in.account.full_name.as_deref(), Some("Unnamed User"));
    }

    #[tokio::test]
    async fn test_google_signin_conflicts_with_password_account() {
        let h = harness().await;
        h.manager
            .signup(signup_request("ada@example.com", "password123"))
            .await
            .unwrap();

        match h
            .manager
            .signin_with_google(
                GoogleSigninRequest {
                    id_token: "google-ada".to_string(),
                },
                Provenance::default(),
            )
            .await
        {
            Err(AuthError::Conflict(msg)) => assert_eq!(msg, PASSWORD_ACCOUNT_EXISTS),
            other => panic!("Expected Conflict error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_google_signin_rejects_bad_token() {
        let h = harness().await;

        assert!(matches!(
            h.manager
                .signin_with_google(
                    GoogleSigninRequest {
                        id_token: "forged".to_string()
                    },
                    Provenance::default()
                )
                .await,
            Err(AuthError::Unauthorized(_))
        ));
        assert!(matches!(
            h.manager
                .signin_with_google(
                    GoogleSigninRequest {
                        id_token: " ".to_string()
                    },
                    Provenance::default()
                )
                .await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_password_signin_on_google_account_is_unauthorized() {
        let h = harness().await;
        h.manager
            .signin_with_google(
                GoogleSigninRequest {
                    id_token: "google-ada".to_string(),
                },
                Provenance::default(),
            )
            .await
            .unwrap();

        assert!(matches!(
            h.manager
                .signin(signin_request("ada@example.com", "password123"), Provenance::default())
                .await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_far_from_expiry() {
        let h = harness().await;
        let signed_in = verified_account(&h, "ada@example.com", "password123").await;
        let session_id = signed_in.session.session.id.clone();
        let before = raw_refresh_columns(&h.db, &session_id).await;

        h.clock.advance(ChronoDuration::days(1));
        let rotated = h
            .manager
            .refresh(
                RefreshTokenRequest {
                    user_id: signed_in.account.id.clone(),
                    refresh_token: signed_in.session.refresh_token.clone(),
                },
                Provenance::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            rotated.access_token_expires_at,
            h.clock.now() + ChronoDuration::minutes(ACCESS_TOKEN_TTL_MINUTES)
        );
        assert_ne!(rotated.access_token, signed_in.session.session.access_token);
        assert!(rotated.refresh_token.is_none());
        assert!(rotated.refresh_token_expires_at.is_none());

        let after = raw_refresh_columns(&h.db, &session_id).await;
        assert_eq!(before, after);

        // Same refresh token still works
        h.manager
            .refresh(
                RefreshTokenRequest {
                    user_id: signed_in.account.id.clone(),
                    refresh_token: signed_in.session.refresh_token.clone(),
                },
                Provenance::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_rotates_near_expiry_and_old_token_dies() {
        let h = harness().await;
        let signed_in = verified_account(&h, "ada@example.com", "password123").await;

        h.clock
            .advance(ChronoDuration::days(REFRESH_TOKEN_TTL_DAYS) - ChronoDuration::hours(12));
        let rotated = h
            .manager
            .refresh(
                RefreshTokenRequest {
                    user_id: signed_in.account.id.clone(),
                    refresh_token: signed_in.session.refresh_token.clone(),
                },
                Provenance::default(),
            )
            .await
            .unwrap();

        let new_refresh = rotated.refresh_token.clone().unwrap();
        assert_ne!(new_refresh, signed_in.session.refresh_token);
        assert_eq!(
            rotated.refresh_token_expires_at,
            Some(h.clock.now() + ChronoDuration::days(REFRESH_TOKEN_TTL_DAYS))
        );
        assert_eq!(
            rotated.access_token_expires_at,
            h.clock.now() + ChronoDuration::minutes(ACCESS_TOKEN_TTL_MINUTES)
        );

        // Replaying the superseded token fails
        match h
            .manager
            .refresh(
                RefreshTokenRequest {
                    user_id: signed_in.account.id.clone(),
                    refresh_token: signed_in.session.refresh_token.clone(),
                },
                Provenance::default(),
            )
            .await
        {
            Err(AuthError::Unauthorized(msg)) => assert_eq!(msg, "Invalid refresh token"),
            other => panic!("Expected Unauthorized, got {:?}", other),
        }

        h.manager
            .refresh(
                RefreshTokenRequest {
                    user_id: signed_in.account.id.clone(),
                    refresh_token: new_refresh,
                },
                Provenance::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_rotation_single_winner() {
        let h = harness().await;
        let signed_in = verified_account(&h, "ada@example.com", "password123").await;
        h.clock
            .advance(ChronoDuration::days(REFRESH_TOKEN_TTL_DAYS) - ChronoDuration::hours(1));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&h.manager);
            let request = RefreshTokenRequest {
                user_id: signed_in.account.id.clone(),
                refresh_token: signed_in.session.refresh_token.clone(),
            };
            handles.push(tokio::spawn(async move {
                manager.refresh(request, Provenance::default()).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(rotated) => {
                    assert!(rotated.refresh_token.is_some());
                    winners += 1;
                }
                Err(AuthError::Unauthorized(_)) => {}
                Err(other) => panic!("Unexpected error: {:?}", other),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_mismatched_and_expired() {
        let h = harness().await;
        let ada = verified_account(&h, "ada@example.com", "password123").await;
        let bob = verified_account(&h, "bob@example.com", "password123").await;

        // Valid token presented under the wrong account
        assert!(matches!(
            h.manager
                .refresh(
                    RefreshTokenRequest {
                        user_id: bob.account.id.clone(),
                        refresh_token: ada.session.refresh_token.clone(),
                    },
                    Provenance::default(),
                )
                .await,
            Err(AuthError::Unauthorized(_))
        ));
        assert!(matches!(
            h.manager
                .refresh(
                    RefreshTokenRequest {
                        user_id: "no-such-account".to_string(),
                        refresh_token: ada.session.refresh_token.clone(),
                    },
                    Provenance::default(),
                )
                .await,
            Err(AuthError::Unauthorized(_))
        ));

        h.clock.advance(ChronoDuration::days(REFRESH_TOKEN_TTL_DAYS));
        match h
            .manager
            .refresh(
                RefreshTokenRequest {
                    user_id: ada.account.id.clone(),
                    refresh_token: ada.session.refresh_token.clone(),
                },
                Provenance::default(),
            )
            .await
        {
            Err(AuthError::Unauthorized(msg)) => assert_eq!(msg, "Refresh token has expired"),
            other => panic!("Expected Unauthorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_password_reset_scenario() {
        let h = harness().await;
        let signed_in = verified_account(&h, "a@x.com", "password1").await;

        h.manager
            .request_password_reset(RequestPasswordResetRequest {
                email: "A@X.com".to_string(),
            })
            .await
            .unwrap();
        let token = h.mailer.last_reset_token("a@x.com").unwrap();

        h.manager
            .reset_password(ResetPasswordRequest {
                token: token.clone(),
                new_password: "newpass1".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            h.manager
                .signin(signin_request("a@x.com", "password1"), Provenance::default())
                .await,
            Err(AuthError::Unauthorized(_))
        ));
        h.manager
            .signin(signin_request("a@x.com", "newpass1"), Provenance::default())
            .await
            .unwrap();

        // Sessions from before the reset are gone
        assert!(matches!(
            h.manager
                .refresh(
                    RefreshTokenRequest {
                        user_id: signed_in.account.id.clone(),
                        refresh_token: signed_in.session.refresh_token.clone(),
                    },
                    Provenance::default(),
                )
                .await,
            Err(AuthError::Unauthorized(_))
        ));

        // Token is single-use
        assert!(matches!(
            h.manager
                .reset_password(ResetPasswordRequest {
                    token,
                    new_password: "newpass2".to_string(),
                })
                .await,
            Err(AuthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_password_reset_token_expiry() {
        let h = harness().await;
        verified_account(&h, "ada@example.com", "password123").await;
        h.manager
            .request_password_reset(RequestPasswordResetRequest {
                email: "ada@example.com".to_string(),
            })
            .await
            .unwrap();
        let token = h.mailer.last_reset_token("ada@example.com").unwrap();

        h.clock.advance(ChronoDuration::minutes(16));

        assert!(matches!(
            h.manager
                .reset_password(ResetPasswordRequest {
                    token,
                    new_password: "newpass123".to_string(),
                })
                .await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_password_reset_request_is_silent_for_unknown_and_federated() {
        let h = harness().await;
        h.manager
            .signin_with_google(
                GoogleSigninRequest {
                    id_token: "google-ada".to_string(),
                },
                Provenance::default(),
            )
            .await
            .unwrap();

        for email in ["nobody@example.com", "ada@example.com"] {
            h.manager
                .request_password_reset(RequestPasswordResetRequest {
                    email: email.to_string(),
                })
                .await
                .unwrap();
        }

        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_signout_and_list() {
        let h = harness().await;
        let first = verified_account(&h, "ada@example.com", "password123").await;
        let second = h
            .manager
            .signin(signin_request("ada@example.com", "password123"), Provenance::default())
            .await
            .unwrap();

        let caller = h
            .manager
            .authenticate(&second.session.session.access_token)
            .await
            .unwrap();
        assert_eq!(caller.account_id, first.account.id);
        assert_eq!(caller.session_id, second.session.session.id);

        assert_eq!(h.manager.list_sessions(&caller).await.unwrap().len(), 2);

        h.manager.signout(&caller).await.unwrap();
        assert!(matches!(
            h.manager.authenticate(&second.session.session.access_token).await,
            Err(AuthError::Unauthorized(_))
        ));
        assert!(matches!(
            h.manager.signout(&caller).await,
            Err(AuthError::NotFound(_))
        ));

        let remaining = h
            .manager
            .authenticate(&first.session.session.access_token)
            .await
            .unwrap();
        assert_eq!(h.manager.list_sessions(&remaining).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_supersedes_previous_access_token() {
        let h = harness().await;
        let signed_in = verified_account(&h, "ada@example.com", "password123").await;

        h.clock.advance(ChronoDuration::minutes(5));
        let rotated = h
            .manager
            .refresh(
                RefreshTokenRequest {
                    user_id: signed_in.account.id.clone(),
                    refresh_token: signed_in.session.refresh_token.clone(),
                },
                Provenance::default(),
            )
            .await
            .unwrap();

        assert!(matches!(
            h.manager.authenticate(&signed_in.session.session.access_token).await,
            Err(AuthError::Unauthorized(_))
        ));
        h.manager.authenticate(&rotated.access_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate_rejects_access_token_past_expiry() {
        let h = harness().await;
        let signed_in = verified_account(&h, "ada@example.com", "password123").await;

        h.clock
            .advance(ChronoDuration::minutes(ACCESS_TOKEN_TTL_MINUTES));
        assert!(matches!(
            h.manager.authenticate(&signed_in.session.session.access_token).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let h = harness().await;
        let signed_in = verified_account(&h, "ada@example.com", "password123").await;
        h.manager
            .signup(signup_request("pending@example.com", "password123"))
            .await
            .unwrap();

        assert_eq!(h.manager.sweep_expired().await.unwrap(), (0, 0));

        h.clock.advance(ChronoDuration::days(REFRESH_TOKEN_TTL_DAYS) + ChronoDuration::seconds(1));
        let (sessions_ended, tokens_cleared) = h.manager.sweep_expired().await.unwrap();
        assert_eq!(sessions_ended, 1);
        assert_eq!(tokens_cleared, 1);

        let active = session::find_active_for_account(&h.db, &signed_in.account.id)
            .await
            .unwrap();
        assert!(active.is_empty());
    }
}
