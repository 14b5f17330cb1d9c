//! Provides an in memory implementation of [`Backend`].
//!
//! All jobs live behind a single mutex, so every operation is trivially atomic. This makes it a
//! correct store for tests and for single process deployments that do not need durability, but
//! jobs are lost when the process exits.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{Backend, BackendError, EnqueuableJob, LEASE_EXPIRED_ERROR};
use crate::{
    job::{ClaimedJob, Job, JobId, Lease, WorkerToken},
    metrics::QueueMetrics,
    notifier::{Notifier, Wake, WakeReceiver},
};

/// An in memory implementation of [`Backend`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<Mutex<BTreeMap<JobId, Job>>>,
    id_counter: Arc<AtomicI64>,
    notifier: Notifier,
    paused: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the backend in paused mode where subscribers are not woken when jobs are inserted or
    /// retried. Workers then only find jobs by polling.
    ///
    /// Call [`InMemoryBackend::notify_all`] to wake subscribers by hand.
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up all subscribers of all queues.
    pub fn notify_all(&self) -> Result<(), BackendError> {
        self.notifier.notify_all()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<JobId, Job>>, BackendError> {
        self.jobs.lock().map_err(|_| BackendError::BadState)
    }

    /// Wakes are best effort: the job is already stored, so a failed wake is only logged.
    fn notify(&self, queue_name: &str, run_at: DateTime<Utc>) {
        if self.paused.load(Ordering::Relaxed) {
            return;
        }
        let _ = self
            .notifier
            .notify(Wake {
                queue_name: queue_name.to_owned(),
                run_at,
            })
            .inspect_err(|error| {
                tracing::warn!(?error, "Failed to wake subscribers of {queue_name}: {error}")
            });
    }
}

fn offset(now: DateTime<Utc>, delta: TimeDelta) -> Result<DateTime<Utc>, BackendError> {
    now.checked_add_signed(delta)
        .ok_or_else(|| BackendError::OutOfRange(format!("{now} + {delta}")))
}

impl EnqueuableJob {
    pub(crate) fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            queue_name: self.queue_name,
            payload: self.payload,
            run_at: Some(self.run_at.unwrap_or(now)),
            lease: None,
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Job {
    fn reserve(
        &mut self,
        token: WorkerToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ClaimedJob {
        self.lease = Some(Lease {
            holder: token,
            expires_at,
        });
        self.attempts += 1;
        self.updated_at = now;
        ClaimedJob {
            id: self.id,
            queue_name: self.queue_name.clone(),
            payload: self.payload.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            reserved_until: expires_at,
            worker_token: token,
        }
    }

    fn release_for_retry(&mut self, error: &str, retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.run_at = match self.is_exhausted() {
            true => None,
            false => Some(retry_at),
        };
        self.lease = None;
        self.last_error = Some(error.to_owned());
        self.updated_at = now;
    }

    fn lease_expired_on_final_attempt(&self, now: DateTime<Utc>) -> bool {
        self.run_at.is_some()
            && self.is_exhausted()
            && self.lease.is_some_and(|lease| !lease.is_live_at(now))
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let id = JobId::from(self.id_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let queue_name = job.queue_name.clone();
        let job = job.into_job(id, Utc::now());
        let run_at = job.run_at;

        self.lock()?.insert(id, job);

        if let Some(run_at) = run_at {
            self.notify(&queue_name, run_at);
        }
        Ok(id)
    }

    async fn claim(
        &self,
        queue_name: &str,
        lease: TimeDelta,
        token: WorkerToken,
    ) -> Result<Option<ClaimedJob>, BackendError> {
        let now = Utc::now();
        let expires_at = offset(now, lease)?;
        let mut jobs = self.lock()?;

        jobs.values_mut()
            .filter(|job| job.queue_name == queue_name && job.lease_expired_on_final_attempt(now))
            .for_each(|job| job.release_for_retry(LEASE_EXPIRED_ERROR, now, now));

        Ok(jobs
            .values_mut()
            .filter(|job| job.queue_name == queue_name && job.is_ready_at(now))
            .min_by_key(|job| (job.run_at, job.id))
            .map(|job| job.reserve(token, expires_at, now)))
    }

    async fn complete(&self, id: JobId, token: WorkerToken) -> Result<bool, BackendError> {
        let mut jobs = self.lock()?;
        match jobs.get(&id) {
            Some(job) if job.lease.is_none() || job.is_held_by(&token) => {
                jobs.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: JobId,
        token: WorkerToken,
        error: &str,
        retry_delay: TimeDelta,
    ) -> Result<bool, BackendError> {
        let now = Utc::now();
        let retry_at = offset(now, retry_delay)?;
        let wake = {
            let mut jobs = self.lock()?;
            match jobs.get_mut(&id) {
                Some(job) if job.is_held_by(&token) => {
                    job.release_for_retry(error, retry_at, now);
                    job.run_at.map(|run_at| (job.queue_name.clone(), run_at))
                }
                _ => return Ok(false),
            }
        };
        if let Some((queue_name, run_at)) = wake {
            self.notify(&queue_name, run_at);
        }
        Ok(true)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        token: WorkerToken,
        lease: TimeDelta,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        let now = Utc::now();
        let expires_at = offset(now, lease)?;
        let mut jobs = self.lock()?;
        Ok(jobs
            .get_mut(&id)
            .filter(|job| job.is_held_by(&token) && !job.lease_expired_on_final_attempt(now))
            .map(|job| {
                job.lease = Some(Lease {
                    holder: token,
                    expires_at,
                });
                job.updated_at = now;
                expires_at
            }))
    }

    async fn metrics(&self, queue_name: Option<&str>) -> Result<Vec<QueueMetrics>, BackendError> {
        let jobs = self.lock()?;
        Ok(QueueMetrics::tally(jobs.values(), queue_name, Utc::now()))
    }

    async fn subscribe(&self, queue_name: &str) -> Result<WakeReceiver, BackendError> {
        self.notifier.subscribe(queue_name)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self.lock()?.get(&id).cloned())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::test_suite;

    test_suite!(for: InMemoryBackend::new());

    #[tokio::test]
    async fn enqueue_does_not_wake_subscriber_when_paused() {
        let backend = InMemoryBackend::new().paused();
        let mut receiver = backend.subscribe("queue").await.unwrap();

        backend
            .enqueue(EnqueuableJob::mock_job().with_queue_name("queue"))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(50), receiver.recv()).await;
        assert!(result.is_err(), "Should not get woken up");
    }

    #[tokio::test]
    async fn calling_notify_all_wakes_paused_subscribers() {
        let backend = InMemoryBackend::new().paused();
        let mut receiver = backend.subscribe("queue").await.unwrap();

        backend.notify_all().unwrap();

        let wake = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("Didn't get woken by notify_all")
            .unwrap();
        assert_eq!(wake.queue_name, "queue");
    }

    #[tokio::test]
    async fn job_ids_increase_monotonically() {
        let backend = InMemoryBackend::new();
        let first = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let second = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        assert!(second > first);
    }

    #[tokio::test]
    async fn failed_wakes_do_not_fail_the_operation() {
        let backend = InMemoryBackend::new();
        let token = WorkerToken::new();
        backend.notifier.poison();

        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend
            .claim("default", TimeDelta::seconds(30), token)
            .await
            .unwrap()
            .expect("Job should have been stored");
        assert!(backend.fail(id, token, "error", TimeDelta::zero()).await.unwrap());

        let job = backend.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.lease, None);
        assert_eq!(job.last_error.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn out_of_range_lease_does_not_poison_the_store() {
        let backend = InMemoryBackend::new();
        let token = WorkerToken::new();
        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        assert_matches!(
            backend
                .claim("default", TimeDelta::days(365 * 300_000), token)
                .await,
            Err(BackendError::OutOfRange(_))
        );

        assert!(backend.enqueue(EnqueuableJob::mock_job()).await.is_ok());
        assert!(backend
            .claim("default", TimeDelta::seconds(30), token)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn badstate_errors() {
        let backend = InMemoryBackend::new();
        let token = WorkerToken::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.jobs.lock();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            backend.enqueue(EnqueuableJob::mock_job()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.claim("default", TimeDelta::seconds(30), token).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.complete(id, token).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.fail(id, token, "error", TimeDelta::zero()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend
                .extend_lease(id, token, TimeDelta::seconds(30))
                .await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.metrics(None).await, Err(BackendError::BadState));
        assert_matches!(backend.get_job(id).await, Err(BackendError::BadState));
    }
}
