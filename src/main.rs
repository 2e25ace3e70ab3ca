/// Reelio auth service
///
/// Account signup and signin, email verification, password reset and
/// refresh-token session rotation for the Reelio apps.

mod account;
mod api;
mod auth;
mod clock;
mod config;
mod context;
mod db;
mod error;
mod identity;
mod jobs;
mod mailer;
mod server;

use config::{LoggingConfig, ServerConfig};
use context::AppContext;
use error::AuthResult;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> AuthResult<()> {
    // Load configuration
    let config = ServerConfig::from_env()?;

    // Initialize logging
    init_tracing(&config.logging);

    // Print banner
    print_banner();

    // Create application context
    let ctx = Arc::new(AppContext::new(config).await?);

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Start server
    server::serve((*ctx).clone()).await?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| EnvFilter::new("reelio_auth=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn print_banner() {
    println!(
        r#"
    ____            ___
   / __ \___  ___  / (_)___
  / /_/ / _ \/ _ \/ / / __ \
 / _, _/  __/  __/ / / /_/ /
/_/ |_|\___/\___/_/_/\____/

        Reelio auth service v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
