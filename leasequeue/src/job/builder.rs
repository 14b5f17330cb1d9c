use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use super::JobId;
use crate::{
    backend::{Backend, EnqueuableJob},
    validate_duration, JobQueue, JobQueueError, ValidationError,
};

enum Schedule {
    At(DateTime<Utc>),
    In(TimeDelta),
}

/// Builds a job for [`JobQueue`], see [`JobQueue::job`].
pub struct JobBuilder<'q, B> {
    queue: &'q JobQueue<B>,
    queue_name: String,
    schedule: Option<Schedule>,
    max_attempts: Option<u32>,
}

impl<'q, B> JobBuilder<'q, B>
where
    B: Backend,
{
    pub(crate) fn new(queue: &'q JobQueue<B>, queue_name: String) -> Self {
        Self {
            queue,
            queue_name,
            schedule: None,
            max_attempts: None,
        }
    }

    /// The job will not be claimable before `run_at`.
    pub fn run_at(self, run_at: DateTime<Utc>) -> Self {
        Self {
            schedule: Some(Schedule::At(run_at)),
            ..self
        }
    }

    /// The job will not be claimable before `delay` from the time it is enqueued.
    pub fn run_in(self, delay: TimeDelta) -> Self {
        Self {
            schedule: Some(Schedule::In(delay)),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub async fn enqueue<P>(self, payload: P) -> Result<JobId, JobQueueError>
    where
        P: Serialize,
    {
        let run_at = match self.schedule {
            None => None,
            Some(Schedule::At(run_at)) => Some(run_at),
            Some(Schedule::In(delay)) => {
                validate_duration(delay)?;
                Some(
                    Utc::now()
                        .checked_add_signed(delay)
                        .ok_or(ValidationError::DurationOutOfRange(delay))?,
                )
            }
        };
        let job = EnqueuableJob {
            payload: serde_json::to_value(payload)?,
            run_at,
            max_attempts: self
                .max_attempts
                .unwrap_or(self.queue.config().default_max_attempts),
            queue_name: self.queue_name,
        };
        self.queue.enqueue_job(job).await
    }
}
