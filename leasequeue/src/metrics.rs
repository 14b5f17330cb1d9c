use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{Job, JobState};

/// Point in time job counts for a single queue.
///
/// Computed on demand and possibly stale by the time it is read; never base claim decisions on
/// it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub queue_name: String,
    pub ready: u64,
    /// Waiting for a future `run_at`, including retries serving their delay.
    pub scheduled: u64,
    pub leased: u64,
    pub dead_lettered: u64,
    pub total: u64,
}

impl QueueMetrics {
    pub fn empty(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    fn record(&mut self, state: JobState) {
        match state {
            JobState::Ready => self.ready += 1,
            JobState::Scheduled => self.scheduled += 1,
            JobState::Leased => self.leased += 1,
            JobState::DeadLettered => self.dead_lettered += 1,
        }
        self.total += 1;
    }

    /// Tallies `jobs` per queue as of `now`, sorted by queue name.
    ///
    /// When `queue_name` is given only that queue is reported, as an all zero entry if it holds
    /// no jobs.
    pub fn tally<'a>(
        jobs: impl IntoIterator<Item = &'a Job>,
        queue_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<Self> {
        let mut queues: BTreeMap<&str, Self> = BTreeMap::new();
        if let Some(queue_name) = queue_name {
            queues.insert(queue_name, Self::empty(queue_name));
        }
        jobs.into_iter()
            .filter(|job| queue_name.map_or(true, |name| job.queue_name == name))
            .for_each(|job| {
                queues
                    .entry(job.queue_name.as_str())
                    .or_insert_with(|| Self::empty(job.queue_name.as_str()))
                    .record(job.state_at(now))
            });
        queues.into_values().collect()
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use super::*;
    use crate::job::{Lease, WorkerToken};

    #[test]
    fn tally_counts_each_state() {
        let now = Utc::now();
        let jobs = [
            Job::raw_job(),
            Job {
                run_at: Some(now + TimeDelta::hours(1)),
                ..Job::raw_job()
            },
            Job {
                attempts: 1,
                lease: Some(Lease {
                    holder: WorkerToken::new(),
                    expires_at: now + TimeDelta::seconds(30),
                }),
                ..Job::raw_job()
            },
            Job {
                run_at: None,
                attempts: 3,
                ..Job::raw_job()
            },
            Job {
                queue_name: "other".to_owned(),
                ..Job::raw_job()
            },
        ];

        let metrics = QueueMetrics::tally(&jobs, None, Utc::now());

        assert_eq!(
            metrics,
            vec![
                QueueMetrics {
                    queue_name: "default".to_owned(),
                    ready: 1,
                    scheduled: 1,
                    leased: 1,
                    dead_lettered: 1,
                    total: 4,
                },
                QueueMetrics {
                    queue_name: "other".to_owned(),
                    ready: 1,
                    total: 1,
                    ..Default::default()
                },
            ]
        );
    }

    #[test]
    fn tally_for_unknown_queue_is_empty() {
        let jobs = [Job::raw_job()];

        let metrics = QueueMetrics::tally(&jobs, Some("missing"), Utc::now());

        assert_eq!(metrics, vec![QueueMetrics::empty("missing")]);
    }
}
