//! The purpose of this module is to alleviate the need to import many of the `leasequeue` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use leasequeue::prelude::*;
//! ```
pub use crate::backend::Backend;
pub use crate::backoff::{Backoff, Jitter};
pub use crate::config::{QueueConfig, WorkerConfig};
pub use crate::job::{ClaimedJob, Job, JobId, JobState, WorkerToken};
pub use crate::metrics::QueueMetrics;
pub use crate::worker::{Handler, HandlerResult, Worker, WorkerHandle};
pub use crate::{JobQueue, JobQueueError};
