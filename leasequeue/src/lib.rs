//! A durable, at-least-once job queue with lease based ownership.
//!
//! Producers [`JobQueue::enqueue`] jobs onto named queues. Workers [`JobQueue::claim`] the oldest
//! ready job of a queue, which reserves it under their [`WorkerToken`] for a lease period, and
//! then either [`JobQueue::complete`] or [`JobQueue::fail`] it. A job whose lease runs out before
//! either happens becomes claimable again, so a job may be delivered more than once.
//!
//! Failed jobs are retried after a delay until their attempts are exhausted, at which point they
//! are dead-lettered: kept in the store but never claimed again.
//!
//! The job store is pluggable through [`backend::Backend`]. An in memory store is provided in
//! [`backend::memory`]; the `leasequeue-sqlx` crate provides a PostgreSQL store.
//!
//! ```
//! # use leasequeue::{JobQueue, backend::memory::InMemoryBackend, job::WorkerToken};
//! # use chrono::TimeDelta;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = JobQueue::new(InMemoryBackend::new());
//! let job_id = queue.enqueue("mail", "hello@example.com").await.unwrap();
//!
//! let token = WorkerToken::new();
//! let job = queue
//!     .claim("mail", Some(TimeDelta::seconds(30)), &token)
//!     .await
//!     .unwrap()
//!     .expect("job is ready");
//! assert_eq!(job.id, job_id);
//! assert!(queue.complete(job.id, &token).await.unwrap());
//! # });
//! ```
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

pub mod backend;
pub mod backoff;
pub mod config;
pub mod job;
pub mod metrics;
pub mod notifier;
pub mod prelude;
pub mod worker;

use backend::{Backend, BackendError, EnqueuableJob};
use config::QueueConfig;
use job::{builder::JobBuilder, ClaimedJob, Job, JobId, WorkerToken};
use metrics::QueueMetrics;
use notifier::WakeReceiver;

/// The operations of the queue, validated and with defaults applied, over a [`Backend`].
///
/// Cloning is cheap and clones share the backend.
#[derive(Debug)]
pub struct JobQueue<B> {
    backend: Arc<B>,
    config: QueueConfig,
}

impl<B> Clone for JobQueue<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B> Default for JobQueue<B>
where
    B: Backend + Default,
{
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<B> JobQueue<B>
where
    B: Backend,
{
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, QueueConfig::default())
    }

    pub fn with_config(backend: B, config: QueueConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Starts building a job for `queue_name`, to override the default `run_at` or
    /// `max_attempts`.
    pub fn job(&self, queue_name: impl Into<String>) -> JobBuilder<'_, B> {
        JobBuilder::new(self, queue_name.into())
    }

    /// Enqueues `payload` on `queue_name`, ready immediately with the default number of attempts.
    pub async fn enqueue<P>(&self, queue_name: &str, payload: P) -> Result<JobId, JobQueueError>
    where
        P: Serialize,
    {
        self.job(queue_name).enqueue(payload).await
    }

    #[instrument(skip(self, job), fields(queue_name = %job.queue_name, run_at = ?job.run_at))]
    pub(crate) async fn enqueue_job(&self, job: EnqueuableJob) -> Result<JobId, JobQueueError> {
        validate_queue_name(&job.queue_name)?;
        validate_max_attempts(job.max_attempts)?;
        let job_id = self.backend.enqueue(job).await?;
        tracing::debug!(%job_id, "Enqueued job {job_id}");
        Ok(job_id)
    }

    /// Reserves the oldest ready job of `queue_name` for `token`, for `lease` from now or the
    /// configured default lease.
    ///
    /// Returns `None` when no job is ready.
    #[instrument(skip(self))]
    pub async fn claim(
        &self,
        queue_name: &str,
        lease: Option<TimeDelta>,
        token: &WorkerToken,
    ) -> Result<Option<ClaimedJob>, JobQueueError> {
        let lease = lease.unwrap_or(self.config.default_lease);
        validate_queue_name(queue_name)?;
        validate_lease(lease)?;
        let job = self.backend.claim(queue_name, lease, *token).await?;
        if let Some(job) = &job {
            tracing::debug!(
                job_id = %job.id,
                attempts = job.attempts,
                "Claimed job {} until {}",
                job.id,
                job.reserved_until
            );
        }
        Ok(job)
    }

    /// Deletes a finished job. Returns `false` when `token` no longer holds the lease, for
    /// example because it expired and another worker reclaimed the job.
    #[instrument(skip(self))]
    pub async fn complete(&self, job_id: JobId, token: &WorkerToken) -> Result<bool, JobQueueError> {
        let completed = self.backend.complete(job_id, *token).await?;
        match completed {
            true => tracing::debug!(%job_id, "Completed job {job_id}"),
            false => tracing::warn!(%job_id, "Job {job_id} was not completed, lease not held"),
        }
        Ok(completed)
    }

    /// Records a failed attempt.
    ///
    /// The job becomes ready again after `retry_delay`, or the configured default, unless its
    /// attempts are exhausted in which case it is dead-lettered. Returns `false` when `token`
    /// does not hold the lease.
    #[instrument(skip(self, error))]
    pub async fn fail(
        &self,
        job_id: JobId,
        token: &WorkerToken,
        error: &str,
        retry_delay: Option<TimeDelta>,
    ) -> Result<bool, JobQueueError> {
        let retry_delay = retry_delay.unwrap_or(self.config.default_retry_delay);
        validate_retry_delay(retry_delay)?;
        let failed = self.backend.fail(job_id, *token, error, retry_delay).await?;
        if !failed {
            tracing::warn!(%job_id, "Job {job_id} was not failed, lease not held");
        }
        Ok(failed)
    }

    /// Pushes the lease held by `token` out to `lease` from now, or the configured default lease.
    ///
    /// `None` means the lease has been lost and the caller must stop working on the job.
    #[instrument(skip(self))]
    pub async fn extend_lease(
        &self,
        job_id: JobId,
        token: &WorkerToken,
        lease: Option<TimeDelta>,
    ) -> Result<Option<DateTime<Utc>>, JobQueueError> {
        let lease = lease.unwrap_or(self.config.default_lease);
        validate_lease(lease)?;
        let expires_at = self.backend.extend_lease(job_id, *token, lease).await?;
        if expires_at.is_none() {
            tracing::warn!(%job_id, "Lease on job {job_id} is no longer held");
        }
        Ok(expires_at)
    }

    /// Job counts per queue, or for just `queue_name`.
    #[instrument(skip(self))]
    pub async fn metrics(&self, queue_name: Option<&str>) -> Result<Vec<QueueMetrics>, JobQueueError> {
        if let Some(queue_name) = queue_name {
            validate_queue_name(queue_name)?;
        }
        Ok(self.backend.metrics(queue_name).await?)
    }

    /// Subscribes to wake signals for `queue_name`.
    pub async fn subscribe(&self, queue_name: &str) -> Result<WakeReceiver, JobQueueError> {
        validate_queue_name(queue_name)?;
        Ok(self.backend.subscribe(queue_name).await?)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.backend.get_job(job_id).await?)
    }
}

/// The longest lease, retry delay or scheduling offset accepted.
pub const MAX_DURATION: TimeDelta = TimeDelta::days(100 * 365);

/// The largest `max_attempts` a job store is required to hold.
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

fn validate_queue_name(queue_name: &str) -> Result<(), ValidationError> {
    if queue_name.is_empty() {
        return Err(ValidationError::EmptyQueueName);
    }
    Ok(())
}

fn validate_duration(duration: TimeDelta) -> Result<(), ValidationError> {
    if duration.abs() > MAX_DURATION {
        return Err(ValidationError::DurationOutOfRange(duration));
    }
    Ok(())
}

fn validate_lease(lease: TimeDelta) -> Result<(), ValidationError> {
    if lease <= TimeDelta::zero() {
        return Err(ValidationError::NonPositiveLease(lease));
    }
    validate_duration(lease)
}

fn validate_retry_delay(retry_delay: TimeDelta) -> Result<(), ValidationError> {
    if retry_delay < TimeDelta::zero() {
        return Err(ValidationError::NegativeRetryDelay(retry_delay));
    }
    validate_duration(retry_delay)
}

fn validate_max_attempts(max_attempts: u32) -> Result<(), ValidationError> {
    if !(1..=MAX_ATTEMPTS_LIMIT).contains(&max_attempts) {
        return Err(ValidationError::InvalidMaxAttempts(max_attempts));
    }
    Ok(())
}

/// A request rejected before reaching the job store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Queue name must not be empty")]
    EmptyQueueName,
    #[error("Lease duration must be positive, got {0}")]
    NonPositiveLease(TimeDelta),
    #[error("Retry delay must not be negative, got {0}")]
    NegativeRetryDelay(TimeDelta),
    #[error("max_attempts must be between 1 and 2147483647, got {0}")]
    InvalidMaxAttempts(u32),
    #[error("Duration must not exceed 100 years, got {0}")]
    DurationOutOfRange(TimeDelta),
}

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

impl JobQueueError {
    /// Whether the job store was unavailable or aborted the operation. Such calls are safe to
    /// retry.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Backend(BackendError::Storage(_)))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::backend::memory::InMemoryBackend;

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let queue = JobQueue::new(InMemoryBackend::new());

        let job_id = queue.enqueue("mail", "payload").await.unwrap();

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, QueueConfig::DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.payload, serde_json::json!("payload"));
        assert!(job.run_at.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_queue_name() {
        let queue = JobQueue::new(InMemoryBackend::new());

        assert_matches!(
            queue.enqueue("", "payload").await,
            Err(JobQueueError::Validation(ValidationError::EmptyQueueName))
        );
        assert!(queue.metrics(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_rejects_zero_max_attempts() {
        let queue = JobQueue::new(InMemoryBackend::new());

        assert_matches!(
            queue.job("mail").with_max_attempts(0).enqueue(()).await,
            Err(JobQueueError::Validation(ValidationError::InvalidMaxAttempts(0)))
        );
    }

    #[tokio::test]
    async fn claim_rejects_non_positive_lease() {
        let queue = JobQueue::new(InMemoryBackend::new());
        queue.enqueue("mail", ()).await.unwrap();
        let token = WorkerToken::new();

        assert_matches!(
            queue.claim("mail", Some(TimeDelta::zero()), &token).await,
            Err(JobQueueError::Validation(ValidationError::NonPositiveLease(_)))
        );
        assert_matches!(
            queue.claim("mail", Some(TimeDelta::seconds(-1)), &token).await,
            Err(JobQueueError::Validation(ValidationError::NonPositiveLease(_)))
        );
        assert_eq!(queue.metrics(Some("mail")).await.unwrap()[0].ready, 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_max_attempts_beyond_store_range() {
        let queue = JobQueue::new(InMemoryBackend::new());

        assert_matches!(
            queue.job("mail").with_max_attempts(u32::MAX).enqueue(()).await,
            Err(JobQueueError::Validation(ValidationError::InvalidMaxAttempts(_)))
        );
        assert!(queue
            .job("mail")
            .with_max_attempts(MAX_ATTEMPTS_LIMIT)
            .enqueue(())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn out_of_range_durations_are_rejected() {
        let queue = JobQueue::new(InMemoryBackend::new());
        let job_id = queue.enqueue("mail", ()).await.unwrap();
        let token = WorkerToken::new();
        let too_long = MAX_DURATION + TimeDelta::days(1);

        assert_matches!(
            queue.claim("mail", Some(too_long), &token).await,
            Err(JobQueueError::Validation(ValidationError::DurationOutOfRange(_)))
        );
        queue.claim("mail", None, &token).await.unwrap().unwrap();
        assert_matches!(
            queue.extend_lease(job_id, &token, Some(too_long)).await,
            Err(JobQueueError::Validation(ValidationError::DurationOutOfRange(_)))
        );
        assert_matches!(
            queue.fail(job_id, &token, "error", Some(too_long)).await,
            Err(JobQueueError::Validation(ValidationError::DurationOutOfRange(_)))
        );
        assert!(queue.get_job(job_id).await.unwrap().unwrap().is_held_by(&token));
    }

    #[tokio::test]
    async fn claim_and_extend_use_default_lease() {
        let config = QueueConfig::new().with_default_lease(TimeDelta::minutes(10));
        let queue = JobQueue::with_config(InMemoryBackend::new(), config);
        let job_id = queue.enqueue("mail", ()).await.unwrap();
        let token = WorkerToken::new();

        let job = queue.claim("mail", None, &token).await.unwrap().unwrap();
        assert!(job.reserved_until > Utc::now() + TimeDelta::minutes(9));

        let expires_at = queue
            .extend_lease(job_id, &token, None)
            .await
            .unwrap()
            .expect("Lease is held");
        assert!(expires_at > Utc::now() + TimeDelta::minutes(9));
        assert!(expires_at <= Utc::now() + TimeDelta::minutes(10));
    }

    #[tokio::test]
    async fn fail_rejects_negative_retry_delay() {
        let queue = JobQueue::new(InMemoryBackend::new());
        let job_id = queue.enqueue("mail", ()).await.unwrap();
        let token = WorkerToken::new();
        queue
            .claim("mail", Some(TimeDelta::seconds(30)), &token)
            .await
            .unwrap();

        assert_matches!(
            queue
                .fail(job_id, &token, "error", Some(TimeDelta::seconds(-5)))
                .await,
            Err(JobQueueError::Validation(ValidationError::NegativeRetryDelay(_)))
        );
        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert!(job.is_held_by(&token));
    }

    #[tokio::test]
    async fn fail_uses_default_retry_delay() {
        let config = QueueConfig::new().with_default_retry_delay(TimeDelta::hours(2));
        let queue = JobQueue::with_config(InMemoryBackend::new(), config);
        let job_id = queue.enqueue("mail", ()).await.unwrap();
        let token = WorkerToken::new();
        queue
            .claim("mail", Some(TimeDelta::seconds(30)), &token)
            .await
            .unwrap();

        assert!(queue.fail(job_id, &token, "error", None).await.unwrap());

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert!(job.run_at.unwrap() > Utc::now() + TimeDelta::minutes(119));
    }

    #[tokio::test]
    async fn scenario_two_attempts_then_dead_letter() {
        let queue = JobQueue::new(InMemoryBackend::new());
        let token = WorkerToken::new();
        let lease = Some(TimeDelta::seconds(30));
        let job_id = queue
            .job("reports")
            .with_max_attempts(2)
            .enqueue("build")
            .await
            .unwrap();

        let job = queue.claim("reports", lease, &token).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(queue
            .fail(job_id, &token, "boom", Some(TimeDelta::zero()))
            .await
            .unwrap());

        let job = queue.claim("reports", lease, &token).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(queue
            .fail(job_id, &token, "boom again", Some(TimeDelta::zero()))
            .await
            .unwrap());

        assert!(queue.claim("reports", lease, &token).await.unwrap().is_none());
        let metrics = queue.metrics(Some("reports")).await.unwrap();
        assert_eq!(metrics[0].dead_lettered, 1);
        assert_eq!(metrics[0].ready, 0);
    }

    #[tokio::test]
    async fn storage_errors_are_identified() {
        let error = JobQueueError::from(BackendError::Storage("connection refused".to_owned()));
        assert!(error.is_storage());
        assert!(!JobQueueError::from(ValidationError::EmptyQueueName).is_storage());
    }
}
