//! This module provides the orchestration of a whole run.

use std::io;
use std::num::NonZeroU8;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::discovery::{self, Discover};
use crate::download::{self, Client, Manager, CHUNK_SIZE};
use crate::producer::Producer;
use crate::registry::Registry;
use crate::render::{Render, Renderer, RENDER_INTERVAL};
use crate::task::{Queue, Shutdown};
use crate::worker::{self, Context, Pool, POLL_TIMEOUT};

pub const DEFAULT_OUTPUT: &str = "episodes";
pub const DEFAULT_WORKERS: NonZeroU8 = match NonZeroU8::new(8) {
    Some(workers) => workers,
    None => unreachable!(),
};

/// A fatal run failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Discovery(#[from] discovery::Error),
    #[error("cannot create output directory `{}`: {source}", path.display())]
    Filesystem { path: PathBuf, source: io::Error },
}

/// Run configuration.
#[derive(Debug, Clone)]
pub struct Options {
    output: PathBuf,
    workers: NonZeroU8,
    poll_timeout: Duration,
    render_interval: Duration,
    chunk_size: usize,
    client: Client,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            workers: DEFAULT_WORKERS,
            poll_timeout: POLL_TIMEOUT,
            render_interval: RENDER_INTERVAL,
            chunk_size: CHUNK_SIZE,
            client: Client::default(),
        }
    }
}

impl Options {
    #[inline]
    pub fn with_output(self, output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            ..self
        }
    }

    #[inline]
    pub fn with_workers(self, workers: NonZeroU8) -> Self {
        Self { workers, ..self }
    }

    #[inline]
    pub fn with_poll_timeout(self, poll_timeout: Duration) -> Self {
        Self { poll_timeout, ..self }
    }

    #[inline]
    pub fn with_render_interval(self, render_interval: Duration) -> Self {
        Self { render_interval, ..self }
    }

    #[inline]
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        Self { chunk_size, ..self }
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    #[inline]
    pub fn output(&self) -> &Path {
        &self.output
    }

    #[inline]
    pub fn workers(&self) -> NonZeroU8 {
        self.workers
    }
}

/// End-of-run summary.
#[derive(Debug, Default)]
pub struct Report {
    /// Downloaded keys with their size.
    pub downloaded: Vec<(String, u64)>,
    /// Episodes already present, or colliding with another one.
    pub skipped: usize,
    pub failed: Vec<(String, download::Error)>,
}

impl Report {
    /// Whether no task failed.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Download every episode of `discover`, rendering progress through `render`.
///
/// Returns once every enqueued task has completed, successfully or not, and every worker and the renderer have stopped.
/// Per-task failures are collected in the [`Report`]. A discovery error stops feeding new tasks; tasks already enqueued are
/// still completed before the error is returned.
pub async fn run<D, R>(options: Options, discover: &D, render: R) -> Result<Report, Error>
where
    D: Discover + ?Sized,
    R: Render + 'static,
{
    let Options {
        output,
        workers,
        poll_timeout,
        render_interval,
        chunk_size,
        client,
    } = options;

    tokio::fs::create_dir_all(&output).await.map_err(|source| Error::Filesystem {
        path: output.clone(),
        source,
    })?;

    let queue = Queue::new();
    let registry = Registry::new();
    let shutdown = Shutdown::default();
    let (outcomes, mut receiver) = mpsc::unbounded_channel();

    let pool = Pool::start(
        workers,
        Context {
            queue: queue.clone(),
            registry: registry.clone(),
            manager: Manager::new().with_client(client).with_chunk_size(chunk_size),
            shutdown: shutdown.clone(),
            outcomes,
            poll_timeout,
        },
    );
    let renderer = Renderer::spawn(render, registry.clone(), shutdown.clone(), render_interval);

    tracing::debug!("Started {} workers, downloading to `{}`", pool.len(), output.display());

    let mut producer = Producer::new(output, queue.clone());
    let produced = producer.produce(discover).await;

    if let Err(err) = &produced {
        tracing::error!("Discovery aborted after {} episodes: {err}", producer.enqueued() + producer.skipped());
    }

    queue.drain().await;

    debug_assert!(registry.is_empty());

    if shutdown.trigger() {
        tracing::debug!("All {} tasks completed, shutting down", producer.enqueued());
    }

    pool.join().await;
    renderer.join().await;

    let mut report = Report {
        skipped: producer.skipped(),
        ..Default::default()
    };

    // every sender has been dropped with its worker
    while let Some(worker::Outcome { key, result }) = receiver.recv().await {
        match result {
            Ok(written) => report.downloaded.push((key, written)),
            Err(err) => report.failed.push((key, err)),
        }
    }

    produced?;

    Ok(report)
}
