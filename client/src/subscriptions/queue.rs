//! Serial callback queues.
//!
//! Subscriber callbacks never run on the objects actor. Each queue is a tokio
//! task that runs its jobs one at a time, in the order they were dispatched.

use std::panic::{self, AssertUnwindSafe};

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A serial execution context for subscriber callbacks.
///
/// Cloning shares the same queue. The task stops once every clone is dropped.
#[derive(Debug, Clone)]
pub struct CallbackQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl CallbackQueue {
    /// Spawn a new queue on the current tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Subscriber callback panicked");
                }
            }
        });

        Self { sender }
    }

    /// Queue a job. Returns false if the queue has stopped.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.sender.send(Box::new(job)).is_ok()
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}
