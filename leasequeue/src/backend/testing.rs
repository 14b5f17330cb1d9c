//! Test suite for ensuring a correct implementation of a backend.
use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};

use super::{Backend, EnqueuableJob, LEASE_EXPIRED_ERROR};
use crate::job::{JobId, WorkerToken, DEFAULT_QUEUE};

const LEASE: TimeDelta = TimeDelta::seconds(30);
const SHORT_LEASE: TimeDelta = TimeDelta::milliseconds(500);
const PAST_SHORT_LEASE: Duration = Duration::from_millis(1_000);
const TOLERANCE: TimeDelta = TimeDelta::seconds(5);

impl EnqueuableJob {
    #[doc(hidden)]
    pub fn mock_job() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE.to_owned(),
            payload: serde_json::json!({ "data": "data" }),
            run_at: None,
            max_attempts: 5,
        }
    }

    #[doc(hidden)]
    pub fn with_queue_name(self, queue_name: impl ToString) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            ..self
        }
    }

    #[doc(hidden)]
    pub fn with_run_at(self, run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            ..self
        }
    }

    #[doc(hidden)]
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }
}

/// Create test suite for a leasequeue backend.
///
/// For backend implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use leasequeue::test_suite;
/// use leasequeue::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test`:
///
/// ```ignore
/// use leasequeue::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: PgJobStore::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(@cases attr: $attr, args: $args, backend: $backend, cases: [
            enqueue,
            enqueue_wakes_subscriber,
            enqueue_without_run_at_uses_store_clock,
            claim_returns_none_when_queue_empty,
            claim_reserves_job,
            claim_skips_jobs_scheduled_in_future,
            claim_only_takes_from_named_queue,
            claim_is_fifo_by_run_at_then_id,
            concurrent_claims_never_share_a_job,
            concurrent_claims_each_get_a_distinct_job,
            lease_expiry_allows_reclaim,
            complete_removes_job,
            complete_twice_returns_false,
            complete_with_other_token_returns_false,
            fail_schedules_retry,
            fail_twice_returns_false,
            fail_with_other_token_returns_false,
            fail_wakes_subscriber,
            retry_exhaustion_dead_letters_job,
            expired_lease_on_final_attempt_dead_letters_job,
            extend_lease,
            extend_lease_with_other_token_returns_none,
            extend_lease_after_reclaim_returns_none,
            extend_lease_after_final_lease_expired_returns_none,
            out_of_range_durations_leave_store_usable,
            metrics,
            metrics_for_named_queue,
            get_job_not_found,
        ]);
    };
    (@cases attr: $attr:meta, args: $args:tt, backend: $backend:expr, cases: [$($case:ident),* $(,)?]) => {
        $(
            #[$attr]
            async fn $case $args {
                let backend = $backend;
                $crate::backend::testing::$case(backend).await;
            }
        )*
    };
}

pub use crate::test_suite;

async fn claim(backend: &impl Backend, token: WorkerToken) -> Option<crate::job::ClaimedJob> {
    backend.claim(DEFAULT_QUEUE, LEASE, token).await.unwrap()
}

fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    assert!(
        (actual - expected).abs() < TOLERANCE,
        "{actual} is not close to {expected}"
    );
}

#[doc(hidden)]
pub async fn enqueue(backend: impl Backend) {
    let run_at = Utc::now() + TimeDelta::minutes(10);
    let id1 = backend
        .enqueue(EnqueuableJob::mock_job().with_run_at(run_at))
        .await
        .unwrap();
    let id2 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_ne!(id1, id2);
    let job = backend.get_job(id1).await.unwrap().expect("Job should exist");
    assert_eq!(job.queue_name, DEFAULT_QUEUE);
    assert_eq!(job.payload, serde_json::json!({ "data": "data" }));
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 5);
    assert!(job.lease.is_none());
    assert!(job.last_error.is_none());
    assert_close(job.run_at.expect("Should have run_at"), run_at);
}

#[doc(hidden)]
pub async fn enqueue_wakes_subscriber(backend: impl Backend) {
    let mut receiver = backend.subscribe("mail").await.unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue_name("another_queue"))
        .await
        .unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue_name("mail"))
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(2), receiver.recv()).await {
        Ok(Some(wake)) => assert_eq!(wake.queue_name, "mail"),
        Err(_) => panic!("Didn't get woken by enqueue of new job"),
        Ok(None) => panic!("Wake channel closed"),
    }
}

#[doc(hidden)]
pub async fn enqueue_without_run_at_uses_store_clock(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job = backend.get_job(id).await.unwrap().expect("Job should exist");
    assert_eq!(job.run_at, Some(job.created_at));
    assert_eq!(
        claim(&backend, WorkerToken::new()).await.map(|job| job.id),
        Some(id)
    );
}

#[doc(hidden)]
pub async fn claim_returns_none_when_queue_empty(backend: impl Backend) {
    assert!(claim(&backend, WorkerToken::new()).await.is_none());
}

#[doc(hidden)]
pub async fn claim_reserves_job(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job = claim(&backend, token).await.expect("Should claim job");

    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.worker_token, token);
    assert_eq!(job.payload, serde_json::json!({ "data": "data" }));
    assert_close(job.reserved_until, Utc::now() + LEASE);

    let stored = backend.get_job(id).await.unwrap().unwrap();
    let lease = stored.lease.expect("Job should be leased");
    assert_eq!(lease.holder, token);
    assert_eq!(lease.expires_at, job.reserved_until);
    assert_eq!(stored.attempts, 1);

    assert!(claim(&backend, WorkerToken::new()).await.is_none());
}

#[doc(hidden)]
pub async fn claim_skips_jobs_scheduled_in_future(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_run_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();

    assert!(claim(&backend, WorkerToken::new()).await.is_none());
}

#[doc(hidden)]
pub async fn claim_only_takes_from_named_queue(backend: impl Backend) {
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_queue_name("mail"))
        .await
        .unwrap();

    assert!(claim(&backend, WorkerToken::new()).await.is_none());
    let job = backend
        .claim("mail", LEASE, WorkerToken::new())
        .await
        .unwrap()
        .expect("Should claim from mail queue");
    assert_eq!(job.id, id);
    assert_eq!(job.queue_name, "mail");
}

#[doc(hidden)]
pub async fn claim_is_fifo_by_run_at_then_id(backend: impl Backend) {
    let now = Utc::now();
    let later = backend
        .enqueue(EnqueuableJob::mock_job().with_run_at(now - TimeDelta::seconds(5)))
        .await
        .unwrap();
    let earliest = backend
        .enqueue(EnqueuableJob::mock_job().with_run_at(now - TimeDelta::seconds(10)))
        .await
        .unwrap();
    let tied = backend
        .enqueue(EnqueuableJob::mock_job().with_run_at(now - TimeDelta::seconds(5)))
        .await
        .unwrap();

    let token = WorkerToken::new();
    let claimed: Vec<JobId> = vec![
        claim(&backend, token).await.unwrap().id,
        claim(&backend, token).await.unwrap().id,
        claim(&backend, token).await.unwrap().id,
    ];
    assert_eq!(claimed, vec![earliest, later, tied]);
}

#[doc(hidden)]
pub async fn concurrent_claims_never_share_a_job(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let results = futures::future::join_all(
        (0..16).map(|_| backend.claim(DEFAULT_QUEUE, LEASE, WorkerToken::new())),
    )
    .await;

    let claimed: Vec<JobId> = results
        .into_iter()
        .filter_map(|result| result.unwrap())
        .map(|job| job.id)
        .collect();
    assert_eq!(claimed, vec![id]);
}

#[doc(hidden)]
pub async fn concurrent_claims_each_get_a_distinct_job(backend: impl Backend) {
    let mut ids = HashSet::new();
    for _ in 0..8 {
        ids.insert(backend.enqueue(EnqueuableJob::mock_job()).await.unwrap());
    }

    let results = futures::future::join_all(
        (0..8).map(|_| backend.claim(DEFAULT_QUEUE, LEASE, WorkerToken::new())),
    )
    .await;

    let claimed: HashSet<JobId> = results
        .into_iter()
        .map(|result| result.unwrap().expect("Each claimant should get a job").id)
        .collect();
    assert_eq!(claimed, ids);
}

#[doc(hidden)]
pub async fn lease_expiry_allows_reclaim(backend: impl Backend) {
    let first = WorkerToken::new();
    let second = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    backend
        .claim(DEFAULT_QUEUE, SHORT_LEASE, first)
        .await
        .unwrap()
        .expect("Should claim job");
    assert!(claim(&backend, second).await.is_none());

    tokio::time::sleep(PAST_SHORT_LEASE).await;

    let job = claim(&backend, second)
        .await
        .expect("Expired job should be claimable");
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 2);

    assert!(!backend.complete(id, first).await.unwrap());
    assert!(backend.complete(id, second).await.unwrap());
}

#[doc(hidden)]
pub async fn complete_removes_job(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let other = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend, token).await.unwrap();

    assert!(backend.complete(id, token).await.unwrap());

    assert!(backend.get_job(id).await.unwrap().is_none());
    assert!(backend.get_job(other).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn complete_twice_returns_false(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let other = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend, token).await.unwrap();

    assert!(backend.complete(id, token).await.unwrap());
    assert!(!backend.complete(id, token).await.unwrap());

    let other = backend.get_job(other).await.unwrap().unwrap();
    assert_eq!(other.attempts, 0);
}

#[doc(hidden)]
pub async fn complete_with_other_token_returns_false(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend, token).await.unwrap();

    assert!(!backend.complete(id, WorkerToken::new()).await.unwrap());

    let job = backend.get_job(id).await.unwrap().expect("Job should remain");
    assert!(job.is_held_by(&token));
}

#[doc(hidden)]
pub async fn fail_schedules_retry(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend, token).await.unwrap();

    assert!(backend
        .fail(id, token, "Oh dear", TimeDelta::hours(1))
        .await
        .unwrap());

    let job = backend.get_job(id).await.unwrap().unwrap();
    assert!(job.lease.is_none());
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("Oh dear"));
    assert_close(
        job.run_at.expect("Job should be retried"),
        Utc::now() + TimeDelta::hours(1),
    );
    assert!(claim(&backend, token).await.is_none());
}

#[doc(hidden)]
pub async fn fail_twice_returns_false(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend, token).await.unwrap();

    assert!(backend
        .fail(id, token, "first", TimeDelta::zero())
        .await
        .unwrap());
    assert!(!backend
        .fail(id, token, "second", TimeDelta::zero())
        .await
        .unwrap());

    let job = backend.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.last_error.as_deref(), Some("first"));
    assert!(job.run_at.is_some());
}

#[doc(hidden)]
pub async fn fail_with_other_token_returns_false(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend, token).await.unwrap();

    assert!(!backend
        .fail(id, WorkerToken::new(), "not mine", TimeDelta::zero())
        .await
        .unwrap());

    let job = backend.get_job(id).await.unwrap().unwrap();
    assert!(job.is_held_by(&token));
    assert!(job.last_error.is_none());
}

#[doc(hidden)]
pub async fn fail_wakes_subscriber(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend, token).await.unwrap();
    let mut receiver = backend.subscribe(DEFAULT_QUEUE).await.unwrap();

    backend
        .fail(id, token, "retry me", TimeDelta::zero())
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(2), receiver.recv()).await {
        Ok(Some(wake)) => assert_eq!(wake.queue_name, DEFAULT_QUEUE),
        Err(_) => panic!("Didn't get woken by retry"),
        Ok(None) => panic!("Wake channel closed"),
    }
}

#[doc(hidden)]
pub async fn retry_exhaustion_dead_letters_job(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(2))
        .await
        .unwrap();

    let job = claim(&backend, token).await.unwrap();
    assert_eq!(job.attempts, 1);
    assert!(!job.is_final_attempt());
    assert!(backend
        .fail(id, token, "first", TimeDelta::zero())
        .await
        .unwrap());

    let job = claim(&backend, token)
        .await
        .expect("Job should be retried");
    assert_eq!(job.attempts, 2);
    assert!(job.is_final_attempt());
    assert!(backend
        .fail(id, token, "second", TimeDelta::zero())
        .await
        .unwrap());

    assert!(claim(&backend, token).await.is_none());

    let job = backend.get_job(id).await.unwrap().expect("Job is retained");
    assert!(job.run_at.is_none());
    assert!(job.lease.is_none());
    assert_eq!(job.last_error.as_deref(), Some("second"));

    let metrics = backend.metrics(Some(DEFAULT_QUEUE)).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].dead_lettered, 1);
    assert_eq!(metrics[0].ready, 0);
    assert_eq!(metrics[0].total, 1);
}

#[doc(hidden)]
pub async fn expired_lease_on_final_attempt_dead_letters_job(backend: impl Backend) {
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    backend
        .claim(DEFAULT_QUEUE, SHORT_LEASE, WorkerToken::new())
        .await
        .unwrap()
        .expect("Should claim job");

    tokio::time::sleep(PAST_SHORT_LEASE).await;

    let metrics = backend.metrics(Some(DEFAULT_QUEUE)).await.unwrap();
    assert_eq!(metrics[0].dead_lettered, 1);

    assert!(claim(&backend, WorkerToken::new()).await.is_none());

    let job = backend.get_job(id).await.unwrap().expect("Job is retained");
    assert!(job.run_at.is_none());
    assert!(job.lease.is_none());
    assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
}

#[doc(hidden)]
pub async fn extend_lease(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = backend
        .claim(DEFAULT_QUEUE, SHORT_LEASE, token)
        .await
        .unwrap()
        .unwrap();

    let expires_at = backend
        .extend_lease(id, token, TimeDelta::hours(1))
        .await
        .unwrap()
        .expect("Holder should extend lease");

    assert!(expires_at > job.reserved_until);
    assert_close(expires_at, Utc::now() + TimeDelta::hours(1));

    tokio::time::sleep(PAST_SHORT_LEASE).await;
    assert!(claim(&backend, WorkerToken::new()).await.is_none());

    let stored = backend.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.lease.map(|lease| lease.expires_at), Some(expires_at));
    assert_eq!(stored.attempts, 1);
}

#[doc(hidden)]
pub async fn extend_lease_with_other_token_returns_none(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend, token).await.unwrap();

    assert!(backend
        .extend_lease(id, WorkerToken::new(), LEASE)
        .await
        .unwrap()
        .is_none());

    backend.complete(id, token).await.unwrap();
    assert!(backend
        .extend_lease(id, token, LEASE)
        .await
        .unwrap()
        .is_none());
}

#[doc(hidden)]
pub async fn extend_lease_after_reclaim_returns_none(backend: impl Backend) {
    let zombie = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend
        .claim(DEFAULT_QUEUE, SHORT_LEASE, zombie)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(PAST_SHORT_LEASE).await;
    claim(&backend, WorkerToken::new())
        .await
        .expect("Expired job should be claimable");

    assert!(backend
        .extend_lease(id, zombie, LEASE)
        .await
        .unwrap()
        .is_none());
    assert!(!backend
        .fail(id, zombie, "too late", TimeDelta::zero())
        .await
        .unwrap());
    assert!(!backend.complete(id, zombie).await.unwrap());
}

#[doc(hidden)]
pub async fn metrics(backend: impl Backend) {
    let token = WorkerToken::new();
    backend
        .enqueue(EnqueuableJob::mock_job().with_run_at(Utc::now() - TimeDelta::seconds(10)))
        .await
        .unwrap();
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_run_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    let dead = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue_name("mail"))
        .await
        .unwrap();

    // Claim every ready job, then dead-letter one of them and release another for retry.
    let mut claimed = vec![];
    while let Some(job) = claim(&backend, token).await {
        claimed.push(job.id);
    }
    assert_eq!(claimed.len(), 3);
    backend
        .fail(dead, token, "fatal", TimeDelta::zero())
        .await
        .unwrap();
    let released = claimed
        .into_iter()
        .find(|id| *id != dead)
        .expect("Should have claimed another job");
    backend
        .fail(released, token, "retry", TimeDelta::zero())
        .await
        .unwrap();

    let metrics = backend.metrics(None).await.unwrap();
    assert_eq!(metrics.len(), 2);
    let default = &metrics[0];
    assert_eq!(default.queue_name, DEFAULT_QUEUE);
    assert_eq!(default.ready, 1);
    assert_eq!(default.scheduled, 1);
    assert_eq!(default.leased, 1);
    assert_eq!(default.dead_lettered, 1);
    assert_eq!(default.total, 4);
    let mail = &metrics[1];
    assert_eq!(mail.queue_name, "mail");
    assert_eq!(mail.ready, 1);
    assert_eq!(mail.total, 1);
}

#[doc(hidden)]
pub async fn metrics_for_named_queue(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue_name("mail"))
        .await
        .unwrap();

    let metrics = backend.metrics(Some("mail")).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].queue_name, "mail");
    assert_eq!(metrics[0].ready, 1);

    let metrics = backend.metrics(Some("empty")).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].queue_name, "empty");
    assert_eq!(metrics[0].total, 0);
}

#[doc(hidden)]
pub async fn get_job_not_found(backend: impl Backend) {
    assert!(backend.get_job(42.into()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn extend_lease_after_final_lease_expired_returns_none(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    backend
        .claim(DEFAULT_QUEUE, SHORT_LEASE, token)
        .await
        .unwrap()
        .expect("Should claim job");

    tokio::time::sleep(PAST_SHORT_LEASE).await;

    assert_eq!(backend.extend_lease(id, token, LEASE).await.unwrap(), None);
    let metrics = backend.metrics(Some(DEFAULT_QUEUE)).await.unwrap();
    assert_eq!(metrics[0].dead_lettered, 1);
    assert_eq!(metrics[0].leased, 0);
}

#[doc(hidden)]
pub async fn out_of_range_durations_leave_store_usable(backend: impl Backend) {
    let token = WorkerToken::new();
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert!(backend
        .claim(DEFAULT_QUEUE, TimeDelta::MAX, token)
        .await
        .is_err());

    let job = claim(&backend, token)
        .await
        .expect("Job should still be claimable");
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);

    assert!(backend.extend_lease(id, token, TimeDelta::MAX).await.is_err());
    assert!(backend
        .fail(id, token, "error", TimeDelta::MAX)
        .await
        .is_err());

    let stored = backend.get_job(id).await.unwrap().expect("Job should exist");
    assert!(stored.is_held_by(&token));
    assert!(stored.last_error.is_none());
    assert!(backend.enqueue(EnqueuableJob::mock_job()).await.is_ok());
}
