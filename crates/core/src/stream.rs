//! In-order host-copy stream and the completion events it hands out.
//!
//! Jobs enqueued on a [`CopyStream`] run on a dedicated worker thread in
//! submission order, the way copies queued on one accelerator stream do.
//! Their results are only observable through [`StepEvent::wait`].

use std::fmt;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};

use crate::error::{DecoderError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct CopyStream {
    job_tx: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl CopyStream {
    pub fn new(name: &str) -> Result<Self> {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = job_rx.blocking_recv() {
                    job();
                }
            })
            .map_err(|e| DecoderError::Invariant(format!("failed to spawn copy stream: {e}")))?;
        Ok(Self {
            job_tx: Some(job_tx),
            worker: Some(worker),
        })
    }

    /// Queue `job` behind everything already enqueued.
    ///
    /// If the worker is gone the returned event resolves to `StreamClosed`.
    pub fn enqueue<T, F>(&self, job: F) -> StepEvent<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            // Receiver dropped means the step was abandoned
            let _ = done_tx.send(job());
        });
        if let Some(tx) = &self.job_tx {
            // On failure the job (and its sender) is dropped, closing the event
            let _ = tx.send(job);
        }
        StepEvent {
            inner: EventInner::Pending(done_rx),
        }
    }
}

impl Drop for CopyStream {
    fn drop(&mut self) {
        self.job_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for CopyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyStream")
            .field("open", &self.job_tx.is_some())
            .finish()
    }
}

/// Completion signal for one step's host-visible outputs.
pub struct StepEvent<T> {
    inner: EventInner<T>,
}

enum EventInner<T> {
    Ready(T),
    Pending(oneshot::Receiver<Result<T>>),
}

impl<T> StepEvent<T> {
    /// An event that has already completed.
    pub fn ready(value: T) -> Self {
        Self {
            inner: EventInner::Ready(value),
        }
    }

    /// Block until the outputs are available.
    pub fn wait(self) -> Result<T> {
        match self.inner {
            EventInner::Ready(value) => Ok(value),
            EventInner::Pending(rx) => rx.blocking_recv().map_err(|_| DecoderError::StreamClosed)?,
        }
    }
}

impl<T> fmt::Debug for StepEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner {
            EventInner::Ready(_) => "ready",
            EventInner::Pending(_) => "pending",
        };
        f.debug_struct("StepEvent").field("state", &state).finish()
    }
}
