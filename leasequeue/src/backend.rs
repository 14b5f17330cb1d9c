//! The job store abstraction.
//!
//! A [`Backend`] owns all persisted job state and performs every state transition atomically.
//! Ownership of a job is decided purely by comparing [`WorkerToken`]s inside the store, never by
//! in-process locks, since claimants may live in other processes.
//!
//! Backends do not validate their arguments, that is the job of [`crate::JobQueue`].
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::{
    job::{ClaimedJob, Job, JobId, WorkerToken},
    metrics::QueueMetrics,
    notifier::WakeReceiver,
};

pub mod memory;
pub mod testing;

/// Recorded as the `last_error` of a job whose lease ran out on its final attempt.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

#[async_trait]
pub trait Backend: Send + Sync {
    /// Inserts a new unleased job and, once it is durable, publishes a wake for its queue.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;

    /// Atomically reserves the oldest ready job of `queue_name` for `token`.
    ///
    /// Jobs are taken in `(run_at, id)` order. Concurrent claimants must never receive the same
    /// job. Jobs of the queue whose lease expired on their final attempt are dead-lettered as part
    /// of the same unit of work.
    async fn claim(
        &self,
        queue_name: &str,
        lease: TimeDelta,
        token: WorkerToken,
    ) -> Result<Option<ClaimedJob>, BackendError>;

    /// Deletes the job if `token` holds its lease or the job is unleased.
    async fn complete(&self, id: JobId, token: WorkerToken) -> Result<bool, BackendError>;

    /// Releases the lease held by `token`, scheduling a retry after `retry_delay`, or
    /// dead-lettering the job when its attempts are exhausted.
    async fn fail(
        &self,
        id: JobId,
        token: WorkerToken,
        error: &str,
        retry_delay: TimeDelta,
    ) -> Result<bool, BackendError>;

    /// Pushes the lease held by `token` out to `now + lease`, returning the new expiry.
    ///
    /// A lease that ran out on the job's final attempt cannot be extended, the job is already
    /// counted as dead-lettered.
    async fn extend_lease(
        &self,
        id: JobId,
        token: WorkerToken,
        lease: TimeDelta,
    ) -> Result<Option<DateTime<Utc>>, BackendError>;

    async fn metrics(&self, queue_name: Option<&str>) -> Result<Vec<QueueMetrics>, BackendError>;

    async fn subscribe(&self, queue_name: &str) -> Result<WakeReceiver, BackendError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError>;
}

/// A validated request to insert a job.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub queue_name: String,
    pub payload: serde_json::Value,
    /// `None` makes the job ready as of the store's own clock at insert time.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Job store unavailable or operation aborted: {0}")]
    Storage(String),
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Value out of range for the job store: {0}")]
    OutOfRange(String),
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Backend double returning canned claim results, recording terminal calls.
    #[derive(Clone, Default)]
    pub(crate) struct MockBackend {
        claim_returns: Arc<Mutex<Vec<Result<Option<ClaimedJob>, BackendError>>>>,
        pub(crate) completed: Arc<Mutex<Vec<JobId>>>,
        pub(crate) failed: Arc<Mutex<Vec<(JobId, String, TimeDelta)>>>,
        pub(crate) lease_lost: Arc<std::sync::atomic::AtomicBool>,
    }

    impl MockBackend {
        pub(crate) fn expect_claim_returning(
            &self,
            result: Result<Option<ClaimedJob>, BackendError>,
        ) {
            self.claim_returns.lock().unwrap().push(result)
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn enqueue(&self, _job: EnqueuableJob) -> Result<JobId, BackendError> {
            Ok(0.into())
        }
        async fn claim(
            &self,
            _queue_name: &str,
            _lease: TimeDelta,
            _token: WorkerToken,
        ) -> Result<Option<ClaimedJob>, BackendError> {
            self.claim_returns.lock().unwrap().pop().unwrap_or(Ok(None))
        }
        async fn complete(&self, id: JobId, _token: WorkerToken) -> Result<bool, BackendError> {
            self.completed.lock().unwrap().push(id);
            Ok(true)
        }
        async fn fail(
            &self,
            id: JobId,
            _token: WorkerToken,
            error: &str,
            retry_delay: TimeDelta,
        ) -> Result<bool, BackendError> {
            self.failed
                .lock()
                .unwrap()
                .push((id, error.to_owned(), retry_delay));
            Ok(true)
        }
        async fn extend_lease(
            &self,
            _id: JobId,
            _token: WorkerToken,
            lease: TimeDelta,
        ) -> Result<Option<DateTime<Utc>>, BackendError> {
            if self.lease_lost.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(None)
            } else {
                Ok(Some(Utc::now() + lease))
            }
        }
        async fn metrics(
            &self,
            _queue_name: Option<&str>,
        ) -> Result<Vec<QueueMetrics>, BackendError> {
            Ok(vec![])
        }
        async fn subscribe(&self, _queue_name: &str) -> Result<WakeReceiver, BackendError> {
            let (_sender, receiver) = tokio::sync::mpsc::unbounded_channel();
            Ok(receiver)
        }
        async fn get_job(&self, _id: JobId) -> Result<Option<Job>, BackendError> {
            Ok(None)
        }
    }
}
