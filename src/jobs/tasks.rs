/// Background task implementations
use crate::{context::AppContext, error::AuthResult};

/// Deactivate sessions past refresh expiry and clear expired verification
/// and reset tokens. Returns the total number of rows touched.
pub async fn sweep_expired(ctx: &AppContext) -> AuthResult<u64> {
    let (sessions_ended, tokens_cleared) = ctx.account_manager.sweep_expired().await?;
    Ok(sessions_ended + tokens_cleared)
}

/// Health check - verify the database answers
pub async fn health_check(ctx: &AppContext) -> AuthResult<()> {
    sqlx::query("SELECT 1").fetch_one(&ctx.account_db).await?;
    Ok(())
}
