//! A crate downloading the episodes of a podcast archive concurrently.
//!
//! Episodes are discovered lazily from the paginated archive, turned into download tasks and pushed to a work queue consumed by a fixed
//! pool of workers, while a renderer repaints a live progress block in the console. The run only ends once every enqueued task has
//! completed, whether it succeeded or failed.
//!
//! It relies on both synchronous and asynchronous synchronization primitives:
//! - an `mpsc` channel behind an asynchronous `Mutex` shared by the workers as the work queue, together with an atomic outstanding count and
//!   a `Notify` to drain it;
//! - a synchronous `Mutex` guarding the progress registry, which is never held across an `.await`;
//! - an atomic flag to signal the shutdown.
//!
//! The flow of a run goes as follows:
//!
//! ```text
//!     discovery ──▶ producer ──▶ queue ──▶ workers (×N) ──▶ registry ──▶ renderer ──▶ terminal
//!                      │                      │
//!                      └── drain, shutdown ──▶┴──▶ renderer
//! ```
//!
//! Completions are signaled through RAII guards, a [`task::Ticket`] for the queue and a [`registry::Entry`] for the registry, so that any way
//! a download ends, whether successful, failed or even panicking, releases both. A drained queue thus always implies an empty registry, and
//! draining can never hang on a task that failed to report itself.
//!
//! As a **strong hypothesis**, we can assume that:
//! - episode titles are unique within the archive, as they make the file names;
//! - a file existing in the output directory is complete, since downloads are only renamed to their final name once complete.

pub mod discovery;
pub mod download;
pub mod producer;
pub mod registry;
pub mod render;
pub mod run;
pub mod task;
pub mod worker;

pub use discovery::{Archive, Discover, Episode};
pub use run::{run, Options, Report};
