/// Serialized write transactions over the account database
///
/// SQLite allows one writer at a time. Write transactions are funnelled
/// through a single permit so two flows never race to upgrade their locks;
/// reads go straight to the pool.
use crate::error::{AuthError, AuthResult};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::{Sqlite, Transaction};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Hands out write transactions one at a time
#[derive(Clone)]
pub struct TransactionCoordinator {
    pool: SqlitePool,
    writer: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl TransactionCoordinator {
    pub fn new(pool: SqlitePool, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            writer: Arc::new(Semaphore::new(1)),
            acquire_timeout,
        }
    }

    /// Begin a write transaction
    ///
    /// Waits at most `acquire_timeout` for the writer permit and again for a
    /// connection.
    pub async fn begin(&self) -> AuthResult<WriteTransaction> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.writer).acquire_owned(),
        )
        .await
        .map_err(|_| AuthError::Internal("Timed out waiting for write transaction".to_string()))?
        .map_err(|_| AuthError::Internal("Transaction coordinator closed".to_string()))?;

        let tx = tokio::time::timeout(self.acquire_timeout, self.pool.begin())
            .await
            .map_err(|_| AuthError::Internal("Timed out opening transaction".to_string()))??;

        Ok(WriteTransaction {
            tx,
            _permit: permit,
        })
    }
}

/// An open write transaction
///
/// Dropping it without `commit` rolls back and releases the writer permit.
pub struct WriteTransaction {
    tx: Transaction<'static, Sqlite>,
    _permit: OwnedSemaphorePermit,
}

impl WriteTransaction {
    pub async fn commit(self) -> AuthResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Deref for WriteTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.tx
    }
}

impl DerefMut for WriteTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}
