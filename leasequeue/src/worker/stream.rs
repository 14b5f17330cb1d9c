use std::time::Duration;

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::{
    backend::Backend,
    config::WorkerConfig,
    job::{ClaimedJob, WorkerToken},
    notifier::{Wake, WakeReceiver},
    JobQueue, JobQueueError,
};

enum Wakeup {
    Elapsed,
    Woken(Wake),
    Closed,
}

/// Claims jobs as they become ready, sleeping in between.
///
/// An idle stream waits for a wake signal or the poll interval, whichever comes first. Wakes for
/// jobs scheduled in the future shorten the wait to that job's `run_at` instead.
pub(super) struct ReadyJobStream<B> {
    queue: JobQueue<B>,
    config: WorkerConfig,
    token: WorkerToken,
    receiver: Option<WakeReceiver>,
    next_run_at: Option<DateTime<Utc>>,
}

impl<B> ReadyJobStream<B>
where
    B: Backend + 'static,
{
    pub(super) fn new(
        queue: JobQueue<B>,
        config: WorkerConfig,
        token: WorkerToken,
        receiver: Option<WakeReceiver>,
    ) -> Self {
        Self {
            queue,
            config,
            token,
            receiver,
            next_run_at: None,
        }
    }

    /// After a failed claim the stream backs off for one poll interval before trying again.
    pub(super) fn into_stream(
        mut self,
    ) -> impl Stream<Item = Result<ClaimedJob, JobQueueError>> + Send {
        stream! {
            loop {
                let result = self.next().await;
                let failed = result.is_err();
                yield result;
                if failed {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn next(&mut self) -> Result<ClaimedJob, JobQueueError> {
        loop {
            if let Some(job) = self
                .queue
                .claim(
                    &self.config.queue_name,
                    Some(self.config.lease_duration),
                    &self.token,
                )
                .await?
            {
                return Ok(job);
            }
            self.wait().await;
        }
    }

    async fn wait(&mut self) {
        let now = Utc::now();
        self.next_run_at = self.next_run_at.filter(|run_at| *run_at > now);
        loop {
            let delay = self.delay();
            let wakeup = match self.receiver.as_mut() {
                Some(receiver) => tokio::select! {
                    wake = receiver.recv() => match wake {
                        Some(wake) => Wakeup::Woken(wake),
                        None => Wakeup::Closed,
                    },
                    _ = tokio::time::sleep(delay) => Wakeup::Elapsed,
                },
                None => {
                    tokio::time::sleep(delay).await;
                    Wakeup::Elapsed
                }
            };
            match wakeup {
                Wakeup::Elapsed => return,
                Wakeup::Woken(wake) if wake.run_at > Utc::now() => {
                    self.next_run_at = Some(match self.next_run_at {
                        Some(run_at) => run_at.min(wake.run_at),
                        None => wake.run_at,
                    });
                }
                Wakeup::Woken(_) => return,
                Wakeup::Closed => {
                    tracing::debug!(
                        "Wake channel for queue {} closed, polling only",
                        self.config.queue_name
                    );
                    self.receiver = None;
                }
            }
        }
    }

    fn delay(&self) -> Duration {
        match self.next_run_at {
            Some(run_at) => (run_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.config.poll_interval),
            None => self.config.poll_interval,
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;
    use futures::StreamExt;

    use super::*;
    use crate::backend::memory::InMemoryBackend;

    const QUEUE: &str = "stream";

    fn stream_for(
        queue: &JobQueue<InMemoryBackend>,
        poll_interval: Duration,
        receiver: Option<WakeReceiver>,
    ) -> ReadyJobStream<InMemoryBackend> {
        ReadyJobStream::new(
            queue.clone(),
            WorkerConfig::new(QUEUE).with_poll_interval(poll_interval),
            WorkerToken::new(),
            receiver,
        )
    }

    #[tokio::test]
    async fn yields_ready_job_immediately() {
        let queue = JobQueue::new(InMemoryBackend::new());
        let job_id = queue.enqueue(QUEUE, ()).await.unwrap();
        let mut stream = stream_for(&queue, Duration::from_secs(60), None);

        let job = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("Job was not claimed")
            .unwrap();
        assert_eq!(job.id, job_id);
    }

    #[tokio::test]
    async fn wake_cuts_poll_interval_short() {
        let queue = JobQueue::new(InMemoryBackend::new());
        let receiver = queue.subscribe(QUEUE).await.unwrap();
        let mut jobs =
            Box::pin(stream_for(&queue, Duration::from_secs(60), Some(receiver)).into_stream());

        let handle = tokio::spawn(async move { jobs.next().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job_id = queue.enqueue(QUEUE, ()).await.unwrap();

        let job = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("Wake did not reach the stream")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.id, job_id);
    }

    #[tokio::test]
    async fn wake_for_future_job_waits_until_run_at() {
        let queue = JobQueue::new(InMemoryBackend::new());
        let receiver = queue.subscribe(QUEUE).await.unwrap();
        let mut stream = stream_for(&queue, Duration::from_secs(60), Some(receiver));
        let job_id = queue
            .job(QUEUE)
            .run_in(TimeDelta::milliseconds(200))
            .enqueue(())
            .await
            .unwrap();

        let job = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("Scheduled job was not claimed at its run_at")
            .unwrap();
        assert_eq!(job.id, job_id);
    }

    #[tokio::test]
    async fn closed_wake_channel_falls_back_to_polling() {
        let queue = JobQueue::new(InMemoryBackend::new());
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        drop(sender);
        let mut stream = stream_for(&queue, Duration::from_millis(20), Some(receiver));

        let handle = tokio::spawn(async move { stream.next().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job_id = queue.enqueue(QUEUE, ()).await.unwrap();

        let job = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("Job was not found by polling")
            .unwrap()
            .unwrap();
        assert_eq!(job.id, job_id);
    }
}
