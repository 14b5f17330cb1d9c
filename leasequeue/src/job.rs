use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

pub mod builder;

/// The queue a job is placed on when none is given.
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Opaque identifier a claimant presents to prove it holds the lease on a job.
///
/// Every worker should use its own token. Two claimants sharing a token can complete each other's
/// jobs.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct WorkerToken(Uuid);

impl WorkerToken {
    /// Generates a new random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WorkerToken {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<WorkerToken> for Uuid {
    fn from(value: WorkerToken) -> Self {
        value.0
    }
}

impl Display for WorkerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A time bounded reservation of a job by a single worker.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Lease {
    pub holder: WorkerToken,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease is live up to and including its expiry instant.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }
}

/// A job as it is held in the job store.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub payload: serde_json::Value,
    /// `None` once the job has been dead-lettered.
    pub run_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobState {
    /// Waiting for its `run_at` to pass.
    Scheduled,
    /// Claimable now.
    Ready,
    /// Held by a worker whose lease has not yet expired.
    Leased,
    /// Retries are exhausted, the job will never be claimed again.
    DeadLettered,
}

impl Job {
    /// Classifies the job at the instant `now`.
    ///
    /// A job whose lease expired on its final attempt counts as dead-lettered even before a claim
    /// has reaped it, since nothing can ever claim it again.
    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        match (self.run_at, self.lease) {
            (_, Some(lease)) if lease.is_live_at(now) => JobState::Leased,
            (None, _) => JobState::DeadLettered,
            (Some(_), _) if self.attempts >= self.max_attempts => JobState::DeadLettered,
            (Some(run_at), _) if run_at > now => JobState::Scheduled,
            _ => JobState::Ready,
        }
    }

    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == JobState::Ready
    }

    pub fn is_held_by(&self, token: &WorkerToken) -> bool {
        self.lease.is_some_and(|lease| lease.holder == *token)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A job handed to a worker by a successful claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob<P = serde_json::Value> {
    pub id: JobId,
    pub queue_name: String,
    pub payload: P,
    /// The attempt count including this claim.
    pub attempts: u32,
    pub max_attempts: u32,
    pub reserved_until: DateTime<Utc>,
    pub worker_token: WorkerToken,
}

impl<P> ClaimedJob<P> {
    /// Whether a failure on this attempt dead-letters the job.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl ClaimedJob {
    /// Decodes the raw JSON payload into the type the worker expects.
    pub fn decode<P>(self) -> Result<ClaimedJob<P>, serde_json::Error>
    where
        P: DeserializeOwned,
    {
        let payload = serde_json::from_value(self.payload)?;
        Ok(ClaimedJob {
            id: self.id,
            queue_name: self.queue_name,
            payload,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            reserved_until: self.reserved_until,
            worker_token: self.worker_token,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use chrono::TimeDelta;

    use super::*;

    impl Job {
        pub(crate) fn raw_job() -> Self {
            let now = Utc::now();
            Self {
                id: 1.into(),
                queue_name: DEFAULT_QUEUE.to_owned(),
                payload: serde_json::Value::Null,
                run_at: Some(now),
                lease: None,
                attempts: 0,
                max_attempts: 3,
                last_error: None,
                created_at: now,
                updated_at: now,
            }
        }
    }

    #[test]
    fn unleased_job_due_now_is_ready() {
        let job = Job::raw_job();
        assert_eq!(job.state_at(Utc::now()), JobState::Ready);
    }

    #[test]
    fn job_due_in_future_is_scheduled() {
        let now = Utc::now();
        let job = Job {
            run_at: Some(now + TimeDelta::minutes(1)),
            ..Job::raw_job()
        };
        assert_eq!(job.state_at(now), JobState::Scheduled);
    }

    #[test]
    fn live_lease_is_leased_and_expired_lease_is_ready() {
        let now = Utc::now();
        let job = Job {
            attempts: 1,
            lease: Some(Lease {
                holder: WorkerToken::new(),
                expires_at: now + TimeDelta::seconds(30),
            }),
            ..Job::raw_job()
        };
        assert_eq!(job.state_at(now), JobState::Leased);
        assert_eq!(
            job.state_at(now + TimeDelta::seconds(31)),
            JobState::Ready
        );
    }

    #[test]
    fn missing_run_at_is_dead_lettered() {
        let job = Job {
            run_at: None,
            attempts: 3,
            ..Job::raw_job()
        };
        assert_eq!(job.state_at(Utc::now()), JobState::DeadLettered);
    }

    #[test]
    fn expired_lease_on_final_attempt_is_dead_lettered() {
        let now = Utc::now();
        let job = Job {
            attempts: 3,
            lease: Some(Lease {
                holder: WorkerToken::new(),
                expires_at: now - TimeDelta::seconds(1),
            }),
            ..Job::raw_job()
        };
        assert_eq!(job.state_at(now), JobState::DeadLettered);
    }

    #[test]
    fn is_held_by_compares_tokens() {
        let token = WorkerToken::new();
        let job = Job {
            lease: Some(Lease {
                holder: token,
                expires_at: Utc::now(),
            }),
            ..Job::raw_job()
        };
        assert!(job.is_held_by(&token));
        assert!(!job.is_held_by(&WorkerToken::new()));
        assert!(!Job::raw_job().is_held_by(&token));
    }

    #[test]
    fn decode_typed_payload() {
        let job = ClaimedJob {
            id: 7.into(),
            queue_name: "mail".to_owned(),
            payload: serde_json::json!({ "to": "someone@example.com" }),
            attempts: 1,
            max_attempts: 1,
            reserved_until: Utc::now(),
            worker_token: WorkerToken::new(),
        };

        #[derive(Deserialize)]
        struct Mail {
            to: String,
        }

        let job = job.decode::<Mail>().unwrap();
        assert_eq!(job.payload.to, "someone@example.com");
        assert!(job.is_final_attempt());
    }
}
