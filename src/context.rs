/// Application context and dependency injection
use crate::{
    account::{password::CredentialHasher, tokens::JwtTokenIssuer, AccountManager, Collaborators},
    clock::SystemClock,
    config::ServerConfig,
    db,
    error::AuthResult,
    identity::GoogleIdTokenVerifier,
    mailer::Mailer,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub account_db: SqlitePool,
    pub account_manager: Arc<AccountManager>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> AuthResult<Self> {
        config.validate()?;

        let account_db = db::create_pool(&config.storage).await?;
        db::run_migrations(&account_db).await?;
        db::test_connection(&account_db).await?;

        let timeout = config.timeouts.external();

        let mailer = Mailer::new(config.email.clone(), &config.service.app_url, timeout)?;
        if !mailer.is_configured() {
            tracing::warn!("SMTP not configured; verification and reset emails will be skipped");
        }

        let google = GoogleIdTokenVerifier::new(
            config.authentication.google_client_id.clone(),
            timeout,
        )?;
        if config.authentication.google_client_id.is_none() {
            tracing::warn!("AUTH_GOOGLE_CLIENT_ID not set; Google sign-in will be rejected");
        }

        let collaborators = Collaborators {
            token_issuer: Arc::new(JwtTokenIssuer::new(&config.authentication.jwt_secret)),
            hasher: CredentialHasher::new(timeout)?,
            mailer: Arc::new(mailer),
            identity_verifier: Arc::new(google),
            clock: Arc::new(SystemClock),
        };

        let account_manager = Arc::new(AccountManager::new(
            account_db.clone(),
            &config,
            collaborators,
        ));

        Ok(Self::from_parts(Arc::new(config), account_db, account_manager))
    }

    /// Assemble a context from already-built services
    pub fn from_parts(
        config: Arc<ServerConfig>,
        account_db: SqlitePool,
        account_manager: Arc<AccountManager>,
    ) -> Self {
        Self {
            config,
            account_db,
            account_manager,
        }
    }
}
