//! Workers run the claim, handle, complete or fail loop for one queue.
//!
//! Implement [`Handler`] for the jobs of a queue and [`Worker::spawn`] as many workers as needed,
//! in as many processes as needed. Workers share nothing but the job store.
//!
//! ```
//! # use leasequeue::prelude::*;
//! # use leasequeue::backend::memory::InMemoryBackend;
//! # use async_trait::async_trait;
//! struct SendMail;
//!
//! #[async_trait]
//! impl Handler for SendMail {
//!     type Payload = String;
//!
//!     async fn handle(&self, job: ClaimedJob<String>) -> HandlerResult {
//!         println!("Sending mail to {}", job.payload);
//!         HandlerResult::Done
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = JobQueue::new(InMemoryBackend::new());
//! let worker = Worker::new(queue.clone(), SendMail)
//!     .with_config(WorkerConfig::new("mail"))
//!     .spawn()
//!     .unwrap();
//!
//! queue.enqueue("mail", "someone@example.com").await.unwrap();
//!
//! worker.graceful_shutdown().await.unwrap();
//! # });
//! ```
use std::{fmt::Display, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    backend::Backend,
    backoff::{Backoff, Jitter},
    config::WorkerConfig,
    job::{ClaimedJob, WorkerToken},
    validate_lease, validate_queue_name, JobQueue, JobQueueError,
};

mod runner;
mod stream;

use runner::JobRunner;
use stream::ReadyJobStream;

/// The default retry delay curve of a [`Handler`]:
///  - exponential backoff starting at 5 seconds,
///  - capped at 5 minutes,
///  - with a 10% jitter margin.
pub const DEFAULT_BACKOFF: Backoff = Backoff::exponential(TimeDelta::seconds(5))
    .with_max(TimeDelta::minutes(5))
    .with_jitter(Jitter::Relative(0.1));

/// Processes the jobs of a queue.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The type the JSON payload of a job is decoded into.
    ///
    /// Use [`serde_json::Value`] to receive the payload undecoded. A payload that fails to decode
    /// fails the job.
    type Payload: DeserializeOwned + Send + 'static;

    async fn handle(&self, job: ClaimedJob<Self::Payload>) -> HandlerResult;

    /// The delay before retrying a job whose `attempts`-th attempt failed.
    ///
    /// Applies to errors, panics, and timeouts but not to [`HandlerResult::Retry`], which carries
    /// its own delay.
    fn backoff(&self, attempts: u32) -> TimeDelta {
        DEFAULT_BACKOFF.delay(attempts)
    }

    /// An upper bound on the runtime of a single attempt. Exceeding it fails the attempt.
    fn timeout(&self, _job: &ClaimedJob<Self::Payload>) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    /// The job is finished and gets removed from the queue.
    Done,
    /// The attempt failed, the job is retried after [`Handler::backoff`] unless this was its final
    /// attempt.
    Error { message: String },
    /// The attempt failed, the job is retried after `delay` unless this was its final attempt.
    Retry { message: String, delay: TimeDelta },
}

impl HandlerResult {
    pub fn error(error: impl Display) -> Self {
        Self::Error {
            message: error.to_string(),
        }
    }
}

/// A not yet running worker, see [`Worker::spawn`].
pub struct Worker<B, H> {
    queue: JobQueue<B>,
    handler: Arc<H>,
    config: WorkerConfig,
    token: WorkerToken,
}

impl<B, H> Worker<B, H>
where
    B: Backend + 'static,
    H: Handler,
{
    /// A worker for the default queue, with a fresh [`WorkerToken`].
    pub fn new(queue: JobQueue<B>, handler: H) -> Self {
        Self {
            queue,
            handler: Arc::new(handler),
            config: WorkerConfig::default(),
            token: WorkerToken::new(),
        }
    }

    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }

    /// The token this worker claims jobs with.
    pub fn token(&self) -> WorkerToken {
        self.token
    }

    /// Starts the poll loop on the tokio runtime.
    ///
    /// Fails when the configured queue name or lease duration is invalid.
    pub fn spawn(self) -> Result<WorkerHandle, JobQueueError> {
        validate_queue_name(&self.config.queue_name)?;
        validate_lease(self.config.lease_duration)?;

        let (sender, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let Self {
                queue,
                handler,
                config,
                token,
            } = self;
            tracing::debug!(
                queue_name = %config.queue_name,
                %token,
                "Starting worker {token} for queue {}",
                config.queue_name
            );

            let receiver = queue
                .subscribe(&config.queue_name)
                .await
                .inspect_err(|error| {
                    tracing::warn!(
                        ?error,
                        "Failed to subscribe to wake signals, falling back to polling: {error}"
                    )
                })
                .ok();
            let runner = JobRunner::new(queue.clone(), handler, &config);
            let jobs = ReadyJobStream::new(queue, config.clone(), token, receiver).into_stream();
            tokio::pin!(jobs);

            loop {
                tokio::select! {
                    biased;
                    _ = rx.recv() => {
                        break;
                    },
                    job = jobs.next() => {
                        match job {
                            Some(Ok(job)) => runner.run(job).await,
                            Some(Err(error)) => tracing::error!(
                                ?error,
                                "Failed to claim job from queue {}: {error}",
                                config.queue_name
                            ),
                            None => break,
                        }
                    },
                }
            }
            tracing::debug!("Shutting down worker {token} for queue {}", config.queue_name);
        });

        Ok(WorkerHandle {
            sender,
            handle: Some(handle),
        })
    }
}

enum Message {
    Terminate,
}

/// Controls a running [`Worker`]. Dropping the handle stops the worker once it is idle.
#[derive(Debug)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stops claiming new jobs and waits for the job in progress, if any, to be completed or
    /// failed.
    pub async fn graceful_shutdown(mut self) -> Result<(), JobQueueError> {
        self.sender
            .send(Message::Terminate)
            .map_err(|_| JobQueueError::GracefulShutdownFailed)?;
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| JobQueueError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}
