//! This module provides the work queue and its drain protocol.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use url::Url;

/// A single file to download.
///
/// Immutable once created. Its `key` is both the file name in the output directory and the key of its
/// [`Registry`](crate::registry::Registry) entry, so it must be unique among concurrently active tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    url: Url,
    destination: PathBuf,
    key: String,
}

impl DownloadTask {
    pub fn new(url: Url, destination: PathBuf, key: String) -> Self {
        Self { url, destination, key }
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A FIFO work queue shared between one producer and many workers.
///
/// # Outstanding count
/// Every [`Queue::push()`] increments an outstanding count and every [`Ticket`] handed out by [`Queue::pop()`] decrements it exactly once,
/// when it is either consumed with [`Ticket::done()`] or dropped (early return, error, panic unwinding, aborted task). The count thus always
/// equals the number of items pushed but not yet completed.
///
/// # Drain
/// [`Queue::drain()`] waits until the outstanding count reaches zero:
/// ```
/// # tokio_test::block_on(async {
/// # use std::time::Duration;
/// # use episodes::task::Queue;
/// let queue = Queue::new();
///
/// for i in 0..3 {
///     queue.push(i);
/// }
///
/// let worker = queue.clone();
/// tokio::spawn(async move {
///     while let Some(ticket) = worker.pop(Duration::from_millis(10)).await {
///         println!("Processing item #{}", *ticket);
///         ticket.done();
///     }
/// });
///
/// queue.drain().await;
/// assert_eq!(queue.outstanding(), 0);
/// # })
/// ```
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    sender: mpsc::UnboundedSender<T>,
    /// The next available worker locks the receiving part and waits for an item.
    receiver: Mutex<mpsc::UnboundedReceiver<T>>,
    outstanding: AtomicUsize,
    drained: Notify,
}

impl<T> Inner<T> {
    fn complete(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);

        debug_assert!(previous > 0, "completion signaled more often than items were pushed");

        if previous == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(receiver),
                outstanding: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Push an item at the back of the queue.
    pub fn push(&self, item: T) {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        if self.inner.sender.send(item).is_err() {
            // the receiver lives as long as the queue itself, keep the count balanced anyway
            self.inner.complete();
        }
    }

    /// Pop the front item, waiting at most `timeout` for one to be pushed.
    ///
    /// The returned [`Ticket`] must be completed (or dropped) once the item has been processed, whatever the outcome.
    pub async fn pop(&self, timeout: Duration) -> Option<Ticket<T>> {
        let recv = async { self.inner.receiver.lock().await.recv().await };

        let item = tokio::time::timeout(timeout, recv).await.ok()??;

        Some(Ticket {
            item,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of items pushed and not completed yet.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Wait until every pushed item has been completed.
    ///
    /// Returns immediately when nothing is outstanding.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);

            // register before checking, so a completion in between cannot be missed
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }

            notified.await;
        }
    }
}

impl<T> Default for Queue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Queue<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("outstanding", &self.outstanding()).finish_non_exhaustive()
    }
}

/// A popped item, signaling its completion to the [`Queue`] once released.
#[must_use = "dropping a ticket immediately completes its item"]
pub struct Ticket<T> {
    item: T,
    inner: Arc<Inner<T>>,
}

impl<T> Ticket<T> {
    /// Signal that the item has been processed.
    #[inline]
    pub fn done(self) {
        drop(self)
    }
}

impl<T> Deref for Ticket<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<T: fmt::Debug> fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ticket").field(&self.item).finish()
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        self.inner.complete();
    }
}

/// A write-once shutdown flag observed by workers and the renderer at each poll boundary.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    /// Raise the flag, returning `true` only for the call that actually raised it.
    #[inline]
    pub fn trigger(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_pop_is_fifo() {
        let queue = Queue::new();

        for i in 0..5 {
            queue.push(i);
        }

        for i in 0..5 {
            let ticket = queue.pop(POLL).await.unwrap();
            assert_eq!(*ticket, i);
            ticket.done();
        }

        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_pop_times_out_on_empty_queue() {
        let queue = Queue::<u8>::new();

        assert!(queue.pop(POLL).await.is_none());
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drain_returns_immediately_when_empty() {
        let queue = Queue::<u8>::new();

        tokio::time::timeout(Duration::from_secs(1), queue.drain()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_ticket_completes_item() {
        let queue = Queue::new();
        queue.push("a");
        queue.push("b");

        let ticket = queue.pop(POLL).await.unwrap();
        assert_eq!(queue.outstanding(), 2);
        drop(ticket);
        assert_eq!(queue.outstanding(), 1);

        let ticket = queue.pop(POLL).await.unwrap();
        ticket.done();
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drain_waits_for_every_completion() {
        let queue = Queue::new();
        let completed = Arc::new(AtomicUsize::new(0));

        for i in 0..50u64 {
            queue.push(i);
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let completed = Arc::clone(&completed);
                tokio::spawn(async move {
                    while let Some(ticket) = queue.pop(POLL).await {
                        tokio::time::sleep(Duration::from_millis(*ticket % 3)).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        // odd items fail and bail out early, only dropping their ticket
                        if *ticket % 2 == 1 {
                            continue;
                        }
                        ticket.done();
                    }
                })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), queue.drain()).await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 50);

        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_panicking_consumer_still_completes() {
        let queue = Queue::new();
        queue.push(());

        let consumer = queue.clone();
        let handle = tokio::spawn(async move {
            let _ticket = consumer.pop(POLL).await.unwrap();
            panic!("boom");
        });

        assert!(handle.await.is_err());
        tokio::time::timeout(Duration::from_secs(1), queue.drain()).await.unwrap();
    }

    #[test]
    fn test_shutdown_is_write_once() {
        let shutdown = Shutdown::default();
        let observer = shutdown.clone();

        assert!(!observer.is_triggered());
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(observer.is_triggered());
    }
}
