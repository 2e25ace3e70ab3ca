/// Configuration management for the Reelio auth service
use crate::error::{AuthError, AuthResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub email: Option<EmailConfig>,
    pub timeouts: TimeoutConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
    /// Base URL used when building links in outgoing email
    pub app_url: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Google OAuth client id expected as the `aud` of ID tokens
    pub google_client_id: Option<String>,
}

/// Email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_url: String,
    pub from_address: String,
}

/// Upper bounds for calls that leave the process or block a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub external_secs: u64,
}

impl TimeoutConfig {
    pub fn external(&self) -> Duration {
        Duration::from_secs(self.external_secs)
    }
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub session_sweep_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit one JSON object per line instead of human-readable output
    pub json: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AuthResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("AUTH_HOSTNAME").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("AUTH_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| AuthError::Validation("Invalid port number".to_string()))?;
        let version = env::var("AUTH_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());
        let app_url = env::var("AUTH_APP_URL").unwrap_or_else(|_| "reelio://".to_string());

        let database_path = env::var("AUTH_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/auth.sqlite"));
        let max_connections = env::var("AUTH_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let jwt_secret = env::var("AUTH_JWT_SECRET")
            .map_err(|_| AuthError::Validation("JWT secret required".to_string()))?;
        let google_client_id = env::var("AUTH_GOOGLE_CLIENT_ID")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let email = if let Ok(smtp_url) = env::var("AUTH_EMAIL_SMTP_URL") {
            Some(EmailConfig {
                smtp_url,
                from_address: env::var("AUTH_EMAIL_FROM_ADDRESS")
                    .unwrap_or_else(|_| format!("noreply@{}", hostname)),
            })
        } else {
            None
        };

        let external_secs = env::var("AUTH_EXTERNAL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);
        let session_sweep_interval_secs = env::var("AUTH_SESSION_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3600);

        let log_level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "reelio_auth=debug,tower_http=debug".to_string());
        let log_json = env::var("AUTH_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                version,
                app_url,
            },
            storage: StorageConfig {
                database_path,
                max_connections,
            },
            authentication: AuthConfig {
                jwt_secret,
                google_client_id,
            },
            email,
            timeouts: TimeoutConfig { external_secs },
            jobs: JobsConfig {
                session_sweep_interval_secs,
            },
            logging: LoggingConfig {
                level: log_level,
                json: log_json,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> AuthResult<()> {
        if self.service.hostname.is_empty() {
            return Err(AuthError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.authentication.jwt_secret.len() < 32 {
            return Err(AuthError::Validation(
                "JWT secret must be at least 32 characters".to_string(),
            ));
        }

        if self.timeouts.external_secs == 0 {
            return Err(AuthError::Validation(
                "External timeout must be at least one second".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        service: ServiceConfig {
            hostname: "localhost".to_string(),
            port: 3000,
            version: "0.1.0".to_string(),
            app_url: "reelio://".to_string(),
        },
        storage: StorageConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
        },
        authentication: AuthConfig {
            jwt_secret: "test-secret-key-for-testing-only-000000".to_string(),
            google_client_id: Some("test-client.apps.googleusercontent.com".to_string()),
        },
        email: None,
        timeouts: TimeoutConfig { external_secs: 5 },
        jobs: JobsConfig {
            session_sweep_interval_secs: 3600,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            json: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_test_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let mut config = test_config();
        config.authentication.jwt_secret = "short".to_string();

        match config.validate() {
            Err(AuthError::Validation(msg)) => assert!(msg.contains("32 characters")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_hostname() {
        let mut config = test_config();
        config.service.hostname = String::new();
        assert!(config.validate().is_err());
    }
}
