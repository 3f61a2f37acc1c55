//! This module provides the pool of download workers.

use std::any::Any;
use std::num::NonZeroU8;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{self, Future, FutureExt};
use tokio::sync::mpsc;

use crate::download::{self, Manager};
use crate::registry::Registry;
use crate::task::{DownloadTask, Queue, Shutdown};

/// How long an idle worker waits for a task before checking the shutdown flag again.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// The result of one task, success or typed failure.
#[derive(Debug)]
pub struct Outcome {
    pub key: String,
    pub result: Result<u64, download::Error>,
}

/// Everything a worker shares with the rest of the run.
#[derive(Debug, Clone)]
pub struct Context {
    pub queue: Queue<DownloadTask>,
    pub registry: Registry,
    pub manager: Manager,
    pub shutdown: Shutdown,
    pub outcomes: mpsc::UnboundedSender<Outcome>,
    pub poll_timeout: Duration,
}

/// A fixed-size pool of download workers.
///
/// Each worker pops tasks from the shared [`Queue`] until the [`Shutdown`] flag is raised, downloads them and reports one
/// [`Outcome`] per task before completing it, so the outcome of every task is available once the queue is drained.
#[derive(Debug)]
pub struct Pool {
    workers: Vec<Worker>,
}

impl Pool {
    /// Start a pool with `size` workers.
    pub fn start(size: NonZeroU8, context: Context) -> Self {
        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get().into();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        Self {
            workers: (0..size).map(|i| Worker::new(id.wrapping_add(i), context.clone())).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to observe the shutdown flag and exit.
    pub async fn join(self) {
        let results = future::join_all(self.workers.into_iter().inspect(|worker| {
            tracing::debug!("Joining worker {}...", worker.id);
        }))
        .await;

        for err in results.into_iter().filter_map(Result::err) {
            tracing::error!("Worker crashed: {err}");
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, context: Context) -> Worker {
        tracing::debug!("Starting worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                let Context {
                    queue,
                    registry,
                    manager,
                    shutdown,
                    outcomes,
                    poll_timeout,
                } = context;

                while !shutdown.is_triggered() {
                    let Some(ticket) = queue.pop(poll_timeout).await else {
                        continue;
                    };

                    tracing::debug!("Downloading `{}` on worker {id}...", ticket.key());

                    let result = catch_panic(manager.download(&ticket, &registry)).await;

                    match &result {
                        Ok(written) => tracing::info!("Downloaded `{}` ({written} bytes)", ticket.key()),
                        Err(err) => tracing::error!("Failed to download `{}`: {err}", ticket.key()),
                    }

                    // report before completing, so that a drained queue implies every outcome is available
                    let _ = outcomes.send(Outcome {
                        key: ticket.key().to_owned(),
                        result,
                    });

                    ticket.done();
                }

                tracing::debug!("Shutdown observed, stopping worker {id}.");
            }),
        }
    }
}

/// Run a download, turning a panic into a failure of its task so that the worker survives it.
async fn catch_panic(future: impl Future<Output = Result<u64, download::Error>>) -> Result<u64, download::Error> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(download::Error::Panicked(panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}
