use chrono::{DateTime, Utc};
use leasequeue::{
    backend::BackendError,
    job::{ClaimedJob, Job, Lease},
    metrics::QueueMetrics,
};
use sqlx::prelude::FromRow;
use uuid::Uuid;

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub run_at: Option<DateTime<Utc>>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub reserved_by: Option<Uuid>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn to_count(value: i32) -> Result<u32, BackendError> {
    u32::try_from(value).map_err(|_| BackendError::BadState)
}

impl TryFrom<JobRow> for Job {
    type Error = BackendError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        let lease = match (value.reserved_by, value.reserved_until) {
            (Some(holder), Some(expires_at)) => Some(Lease {
                holder: holder.into(),
                expires_at,
            }),
            (None, None) => None,
            _ => return Err(BackendError::BadState),
        };
        Ok(Self {
            id: value.id.into(),
            queue_name: value.queue_name,
            payload: value.payload,
            run_at: value.run_at,
            lease,
            attempts: to_count(value.attempts)?,
            max_attempts: to_count(value.max_attempts)?,
            last_error: value.last_error,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ClaimedRow {
    pub id: i64,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub reserved_until: DateTime<Utc>,
    pub reserved_by: Uuid,
}

impl TryFrom<ClaimedRow> for ClaimedJob {
    type Error = BackendError;

    fn try_from(value: ClaimedRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            queue_name: value.queue_name,
            payload: value.payload,
            attempts: to_count(value.attempts)?,
            max_attempts: to_count(value.max_attempts)?,
            reserved_until: value.reserved_until,
            worker_token: value.reserved_by.into(),
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct MetricsRow {
    pub queue_name: String,
    pub ready: i64,
    pub scheduled: i64,
    pub leased: i64,
    pub dead_lettered: i64,
    pub total: i64,
}

impl From<MetricsRow> for QueueMetrics {
    fn from(value: MetricsRow) -> Self {
        Self {
            queue_name: value.queue_name,
            ready: value.ready.unsigned_abs(),
            scheduled: value.scheduled.unsigned_abs(),
            leased: value.leased.unsigned_abs(),
            dead_lettered: value.dead_lettered.unsigned_abs(),
            total: value.total.unsigned_abs(),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;

    fn row() -> JobRow {
        let now = Utc::now();
        JobRow {
            id: 3,
            queue_name: "mail".to_owned(),
            payload: serde_json::json!({ "to": "someone@example.com" }),
            run_at: Some(now),
            reserved_until: None,
            reserved_by: None,
            attempts: 0,
            max_attempts: 25,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn converts_unleased_row() {
        let job = Job::try_from(row()).unwrap();
        assert_eq!(i64::from(job.id), 3);
        assert_eq!(job.lease, None);
        assert_eq!(job.max_attempts, 25);
    }

    #[test]
    fn converts_leased_row() {
        let holder = Uuid::new_v4();
        let expires_at = Utc::now() + TimeDelta::seconds(30);
        let job = Job::try_from(JobRow {
            reserved_by: Some(holder),
            reserved_until: Some(expires_at),
            attempts: 1,
            ..row()
        })
        .unwrap();

        assert_eq!(
            job.lease,
            Some(Lease {
                holder: holder.into(),
                expires_at
            })
        );
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn half_set_lease_is_bad_state() {
        assert_matches!(
            Job::try_from(JobRow {
                reserved_by: Some(Uuid::new_v4()),
                ..row()
            }),
            Err(BackendError::BadState)
        );
        assert_matches!(
            Job::try_from(JobRow {
                reserved_until: Some(Utc::now()),
                ..row()
            }),
            Err(BackendError::BadState)
        );
    }

    #[test]
    fn negative_attempts_are_bad_state() {
        assert_matches!(
            Job::try_from(JobRow {
                attempts: -1,
                ..row()
            }),
            Err(BackendError::BadState)
        );
    }
}
