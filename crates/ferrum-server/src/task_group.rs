//! Fan-out of independent tasks with a counted, cancellable collect.
//!
//! Each task runs on its own tokio task and reports exactly one result over
//! a shared channel. [`TaskGroup::collect`] waits for as many results as were
//! dispatched, or returns early when the caller's token is cancelled. Tasks
//! still running at that point are left to finish on their own.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};

/// Default limit on tasks executing at the same time.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// A set of dispatched tasks producing `(K, T)` results.
pub struct TaskGroup<K, T> {
    tx: mpsc::UnboundedSender<(usize, K, T)>,
    rx: mpsc::UnboundedReceiver<(usize, K, T)>,
    semaphore: Arc<Semaphore>,
    dispatched: usize,
}

impl<K, T> Default for TaskGroup<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> TaskGroup<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    /// Group running at most [`DEFAULT_MAX_PARALLELISM`] tasks at once.
    pub fn new() -> Self {
        Self::with_parallelism(DEFAULT_MAX_PARALLELISM)
    }

    /// Group running at most `max_parallelism` tasks at once.
    pub fn with_parallelism(max_parallelism: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
            dispatched: 0,
        }
    }

    /// Number of tasks dispatched so far.
    pub fn len(&self) -> usize {
        self.dispatched
    }

    /// True if nothing was dispatched.
    pub fn is_empty(&self) -> bool {
        self.dispatched == 0
    }

    /// Dispatch a task whose result is reported under `key`.
    pub fn spawn<F>(&mut self, key: K, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let seq = self.dispatched;
        self.dispatched += 1;
        let tx = self.tx.clone();
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let output = task.await;
            if tx.send((seq, key, output)).is_err() {
                debug!("task {} finished after its group stopped collecting", seq);
            }
        });
    }

    /// Wait for every dispatched task and return the results in dispatch
    /// order.
    pub async fn collect(self, cancel: &CancellationToken) -> ServerResult<Vec<(K, T)>> {
        let TaskGroup {
            tx,
            mut rx,
            dispatched,
            ..
        } = self;
        drop(tx);

        let mut results: Vec<(usize, K, T)> = Vec::with_capacity(dispatched);
        while results.len() < dispatched {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(
                        "collect cancelled with {} of {} results outstanding",
                        dispatched - results.len(),
                        dispatched
                    );
                    return Err(ServerError::Cancelled);
                }
                msg = rx.recv() => match msg {
                    Some(item) => results.push(item),
                    None => {
                        return Err(ServerError::TaskLost {
                            missing: dispatched - results.len(),
                            dispatched,
                        });
                    }
                },
            }
        }

        results.sort_by_key(|(seq, _, _)| *seq);
        Ok(results.into_iter().map(|(_, k, t)| (k, t)).collect())
    }
}
