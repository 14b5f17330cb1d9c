//! A PostgreSQL job store for [`leasequeue`].
//!
//! ```no_run
//! # use leasequeue::JobQueue;
//! # use leasequeue_sqlx::PgJobStore;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/jobs").await?;
//! let queue = JobQueue::new(PgJobStore::from_pool(pool).await?);
//! queue.enqueue("mail", "someone@example.com").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers in any number of processes can
//! poll the same queue without blocking each other. Wake signals travel over `LISTEN/NOTIFY` on
//! the [`WAKE_CHANNEL`] channel.
use std::time::Duration;

use leasequeue::{
    backend::BackendError,
    notifier::{Notifier, Wake},
};
use sqlx::{postgres::PgListener, PgPool};

mod backend;
mod types;

/// The `LISTEN/NOTIFY` channel wake signals are published on.
pub const WAKE_CHANNEL: &str = "leasequeue_wake";

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A [`leasequeue::backend::Backend`] storing jobs in the `leasequeue_jobs` table.
#[derive(Clone, Debug)]
pub struct PgJobStore {
    pool: PgPool,
    notifier: Notifier,
}

impl PgJobStore {
    /// Provisions the schema, which is safe to repeat against an existing database, and starts
    /// listening for wake signals.
    pub async fn from_pool(pool: PgPool) -> Result<Self, BackendError> {
        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|error| {
                tracing::error!(?error, "Failed to migrate job store: {error}");
                BackendError::Storage(error.to_string())
            })?;

        let this = Self {
            pool,
            notifier: Notifier::new(),
        };
        this.listen().await?;
        Ok(this)
    }

    /// Builds a store against an already provisioned database.
    ///
    /// Only wakes published by this store instance reach its subscribers. Use
    /// [`PgJobStore::from_pool`] to receive wakes from every process.
    pub fn from_pool_without_listener(pool: PgPool) -> Self {
        Self {
            pool,
            notifier: Notifier::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn listen(&self) -> Result<(), BackendError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(map_err)?;
        listener.listen(WAKE_CHANNEL).await.map_err(map_err)?;

        tokio::spawn({
            let notifier = self.notifier.clone();
            async move {
                loop {
                    match listener.recv().await {
                        Ok(notification) => {
                            match serde_json::from_str::<Wake>(notification.payload()) {
                                Ok(wake) => {
                                    let _ = notifier.notify(wake).inspect_err(|error| {
                                        tracing::error!(?error, "Failed to forward wake: {error}")
                                    });
                                }
                                Err(error) => tracing::warn!(
                                    ?error,
                                    payload = notification.payload(),
                                    "Ignoring malformed wake notification: {error}"
                                ),
                            }
                        }
                        Err(error) => {
                            tracing::error!(?error, "Wake listener failed: {error}");
                            tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

fn map_err(error: sqlx::Error) -> BackendError {
    tracing::error!(?error, "Job store error: {error}");
    BackendError::Storage(error.to_string())
}
