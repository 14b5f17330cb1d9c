use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use tokio::{
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tracing::{instrument, Instrument};

use super::{Handler, HandlerResult};
use crate::{
    backend::Backend,
    config::WorkerConfig,
    job::{ClaimedJob, JobId, WorkerToken},
    JobQueue,
};

const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(1);

/// The outcome of one attempt, as seen from outside the handler task.
type Attempt = Result<Result<HandlerResult, Duration>, JoinError>;

pub(crate) struct JobRunner<B, H> {
    queue: JobQueue<B>,
    handler: Arc<H>,
    lease_duration: TimeDelta,
    heartbeat: bool,
}

impl<B, H> JobRunner<B, H>
where
    B: Backend + 'static,
    H: Handler,
{
    pub(crate) fn new(queue: JobQueue<B>, handler: Arc<H>, config: &WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            lease_duration: config.lease_duration,
            heartbeat: config.heartbeat,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, attempts = job.attempts))]
    pub(crate) async fn run(&self, job: ClaimedJob) {
        let job_id = job.id;
        let token = job.worker_token;
        let attempts = job.attempts;
        let is_final_attempt = job.is_final_attempt();

        let job = match job.decode::<H::Payload>() {
            Ok(job) => job,
            Err(error) => {
                let message = format!("Failed to decode payload: {error}");
                self.handle_failure(job_id, token, attempts, is_final_attempt, message, None)
                    .await;
                return;
            }
        };

        let timeout = self.handler.timeout(&job);
        let handler = self.handler.clone();
        tracing::debug!(%job_id, "Running job {job_id}");
        let task = tokio::spawn(
            async move {
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, handler.handle(job))
                        .await
                        .map_err(|_elapsed| timeout),
                    None => Ok(handler.handle(job).await),
                }
            }
            .in_current_span(),
        );

        let Some(attempt) = self.supervise(task, job_id, token).await else {
            tracing::warn!(
                %job_id,
                "Lost the lease on job {job_id}, abandoned it without completing or failing"
            );
            return;
        };

        match attempt {
            Ok(Ok(HandlerResult::Done)) => self.handle_done(job_id, token).await,
            Ok(Ok(HandlerResult::Error { message })) => {
                self.handle_failure(job_id, token, attempts, is_final_attempt, message, None)
                    .await
            }
            Ok(Ok(HandlerResult::Retry { message, delay })) => {
                self.handle_failure(
                    job_id,
                    token,
                    attempts,
                    is_final_attempt,
                    message,
                    Some(delay),
                )
                .await
            }
            Ok(Err(timeout)) => {
                let message = format!("Job failed to complete within timeout of {timeout:?}");
                self.handle_failure(job_id, token, attempts, is_final_attempt, message, None)
                    .await
            }
            Err(error) => {
                let message = panic_message(error);
                self.handle_failure(job_id, token, attempts, is_final_attempt, message, None)
                    .await
            }
        }
    }

    /// Waits for the handler task while keeping its lease alive.
    ///
    /// Returns `None` after aborting the task when the lease could not be extended.
    async fn supervise(
        &self,
        mut task: JoinHandle<Result<HandlerResult, Duration>>,
        job_id: JobId,
        token: WorkerToken,
    ) -> Option<Attempt> {
        if !self.heartbeat {
            return Some(task.await);
        }
        let period = (self.lease_duration / 2)
            .to_std()
            .unwrap_or(MIN_HEARTBEAT_PERIOD)
            .max(MIN_HEARTBEAT_PERIOD);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                attempt = &mut task => return Some(attempt),
                _ = heartbeat.tick() => {},
            }
            match self
                .queue
                .extend_lease(job_id, &token, Some(self.lease_duration))
                .await
            {
                Ok(Some(expires_at)) => {
                    tracing::trace!(%job_id, "Extended lease on job {job_id} to {expires_at}")
                }
                Ok(None) => {
                    task.abort();
                    return None;
                }
                Err(error) => tracing::error!(
                    ?error,
                    %job_id,
                    "Failed to extend lease on job {job_id}, error: {error}"
                ),
            }
        }
    }

    async fn handle_done(&self, job_id: JobId, token: WorkerToken) {
        let _ = self
            .queue
            .complete(job_id, &token)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    ?error,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {error}"
                )
            });
    }

    async fn handle_failure(
        &self,
        job_id: JobId,
        token: WorkerToken,
        attempts: u32,
        is_final_attempt: bool,
        message: String,
        delay: Option<TimeDelta>,
    ) {
        let delay = delay
            .unwrap_or_else(|| self.handler.backoff(attempts))
            .max(TimeDelta::zero());
        if is_final_attempt {
            tracing::error!(
                %job_id,
                attempts,
                "Job {job_id} failed on its final attempt and will be dead-lettered: {message}"
            );
        } else {
            tracing::warn!(
                %job_id,
                attempts,
                "Job {job_id} failed and will be retried in {delay}: {message}"
            );
        }
        let _ = self
            .queue
            .fail(job_id, &token, &message, Some(delay))
            .await
            .inspect_err(|error| {
                tracing::error!(
                    ?error,
                    %job_id,
                    "Failed to mark job {job_id} as failed, error: {error}"
                )
            });
    }
}

fn panic_message(error: JoinError) -> String {
    let fallback = error.to_string();
    let message = match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(fallback),
        Err(_) => fallback,
    };
    format!("Job panicked: {message}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn panic_message_includes_payload() {
        let error = tokio::spawn(async { panic!("disk full") }).await.unwrap_err();
        assert_eq!(panic_message(error), "Job panicked: disk full");
    }

    #[tokio::test]
    async fn panic_message_includes_formatted_payload() {
        let code = 7;
        let error = tokio::spawn(async move { panic!("exit code {code}") })
            .await
            .unwrap_err();
        assert_eq!(panic_message(error), "Job panicked: exit code 7");
    }
}
