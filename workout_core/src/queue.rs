//! Strict FIFO delivery queue for outgoing network operations.
//!
//! Operations run one at a time on a dedicated worker task, in submission
//! order; a later operation never starts before an earlier one settles.
//! Retries are layered on top with [`RetryPolicy`], so an operation that is
//! being retried keeps its place at the head of the queue.

use crate::config::DeliveryConfig;
use crate::{Error, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct Job {
    generation: u64,
    label: &'static str,
    run: BoxFuture<'static, ()>,
}

/// Handle to the delivery worker
///
/// Cloning the handle shares the same worker. The worker stops once every
/// handle is dropped and the queue has drained.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Job>,
    generation: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
}

impl DeliveryQueue {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_worker(rx, generation.clone(), pending.clone()));
        Self {
            tx,
            generation,
            pending,
        }
    }

    /// Queue an operation; the returned future resolves with its output
    ///
    /// Resolves to [`Error::QueueClosed`] if the operation was dropped by
    /// [`clear`](Self::clear) before it started.
    pub fn enqueue<F, T>(&self, label: &'static str, op: F) -> impl Future<Output = Result<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            generation: self.generation.load(Ordering::SeqCst),
            label,
            run: async move {
                let output = op.await;
                // The caller may have stopped listening
                let _ = done_tx.send(output);
            }
            .boxed(),
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(op = label, "Delivery worker gone, dropping operation");
        }

        async move { done_rx.await.map_err(|_| Error::QueueClosed) }
    }

    /// Drop every operation that has not started yet
    ///
    /// The operation in flight, if any, runs to completion.
    pub fn clear(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, "Delivery queue cleared");
    }

    /// Operations queued or in flight
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    generation: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
) {
    while let Some(job) = rx.recv().await {
        if job.generation < generation.load(Ordering::SeqCst) {
            tracing::debug!(op = job.label, "Skipping cleared operation");
        } else {
            tracing::trace!(op = job.label, "Running queued operation");
            job.run.await;
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!("Delivery worker stopped");
}

/// Bounded retry with a fixed back-off between attempts
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or `max_attempts` attempts have failed
    ///
    /// Waits `backoff` between attempts, never after the last one.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(op = label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    tracing::error!(op = label, attempts = attempt, error = %e, "Giving up");
                    return Err(Error::Delivery {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Attempt failed, retrying in {:?}",
                        self.backoff
                    );
                }
            }
            tokio::time::sleep(self.backoff).await;
        }
    }
}

/// Queue `op` with retries; `on_exhausted` runs once if every attempt fails
pub fn enqueue_with_retry<T, E, F, Fut, X>(
    queue: &DeliveryQueue,
    policy: RetryPolicy,
    label: &'static str,
    op: F,
    on_exhausted: X,
) -> impl Future<Output = Result<T>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    T: Send + 'static,
    X: FnOnce(&Error) + Send + 'static,
{
    let settled = queue.enqueue(label, async move {
        let result = policy.run(label, op).await;
        if let Err(e) = &result {
            on_exhausted(e);
        }
        result
    });
    async move { settled.await? }
}
