//! Best-effort wake signals for idle workers.
//!
//! A [`Wake`] is published for a queue whenever a job becomes claimable on it. Workers use it to
//! cut short their poll interval. Losing a wake only costs latency: workers always fall back to
//! polling, so nothing in the queue depends on delivery.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::BackendError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wake {
    pub queue_name: String,
    /// When the job that triggered the wake becomes claimable.
    pub run_at: DateTime<Utc>,
}

pub type WakeReceiver = mpsc::UnboundedReceiver<Wake>;

type Subscriber = mpsc::UnboundedSender<Wake>;

/// Fans wake signals out to the subscribers of each queue.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, queue_name: &str) -> Result<WakeReceiver, BackendError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .map_err(|_| BackendError::BadState)?
            .entry(queue_name.to_owned())
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    /// Sends `wake` to every live subscriber of its queue, forgetting subscribers that have gone
    /// away.
    pub fn notify(&self, wake: Wake) -> Result<(), BackendError> {
        let mut subscribers = self.subscribers.write().map_err(|_| BackendError::BadState)?;
        if let Some(senders) = subscribers.get_mut(&wake.queue_name) {
            senders.retain(|sender| sender.send(wake.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(&wake.queue_name);
            }
        }
        Ok(())
    }

    /// Wakes every subscriber of every queue.
    pub fn notify_all(&self) -> Result<(), BackendError> {
        let run_at = Utc::now();
        self.subscribers
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .for_each(|(queue_name, senders)| {
                senders.iter().for_each(|sender| {
                    let _ = sender.send(Wake {
                        queue_name: queue_name.clone(),
                        run_at,
                    });
                })
            });
        Ok(())
    }

    pub fn subscriber_count(&self, queue_name: &str) -> usize {
        self.subscribers
            .read()
            .map(|subscribers| subscribers.get(queue_name).map_or(0, Vec::len))
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl Notifier {
    /// Leaves the subscriber lock poisoned.
    pub(crate) fn poison(&self) {
        let subscribers = self.subscribers.clone();
        let _ = std::thread::spawn(move || {
            let _guard = subscribers.write();
            panic!("poisoning subscriber lock");
        })
        .join();
    }
}
