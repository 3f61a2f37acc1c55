//! This module provides the live console display of the registry.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing_subscriber::fmt::MakeWriter;

use crate::registry::Registry;
use crate::task::Shutdown;

/// Delay between two repaints.
pub const RENDER_INTERVAL: Duration = Duration::from_millis(100);

const CLEAR_LINE: &str = "\x1b[K";

/// Terminal output of an ordered registry snapshot.
///
/// Implementations must be idempotent: rendering the same snapshot twice leaves the same visible output.
pub trait Render: Send {
    fn render(&mut self, snapshot: &[(String, u8)]) -> io::Result<()>;
}

/// Repaints a multi-line block in place using ANSI control sequences.
///
/// Each frame moves the cursor back to the first line of the previous block (`ESC[nF`), prints one line per entry ending with a
/// clear-to-end-of-line (`ESC[K`), and when the block shrinks, clears the remaining lines of the previous block before moving back up
/// over them, so the next frame starts right below the last entry.
#[derive(Debug)]
pub struct AnsiRenderer<W> {
    out: W,
    /// Number of lines of the previous block.
    lines: usize,
}

impl<W: Write> AnsiRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, lines: 0 }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn frame(&self, snapshot: &[(String, u8)]) -> String {
        let mut frame = String::new();

        if self.lines > 0 {
            cursor_prev_lines(&mut frame, self.lines);
        }

        for (key, percent) in snapshot {
            let _ = writeln!(frame, "Downloading {key}... {percent}%{CLEAR_LINE}");
        }

        let stale = self.lines.saturating_sub(snapshot.len());

        if stale > 0 {
            for _ in 0..stale {
                let _ = writeln!(frame, "{CLEAR_LINE}");
            }
            cursor_prev_lines(&mut frame, stale);
        }

        frame
    }
}

/// Move the cursor to the start of the `n`-th previous line.
fn cursor_prev_lines(frame: &mut String, n: usize) {
    let _ = write!(frame, "\x1b[{n}F");
}

impl<W: Write + Send> Render for AnsiRenderer<W> {
    fn render(&mut self, snapshot: &[(String, u8)]) -> io::Result<()> {
        if snapshot.is_empty() && self.lines == 0 {
            return Ok(());
        }

        let frame = self.frame(snapshot);

        self.out.write_all(frame.as_bytes())?;
        self.out.flush()?;

        self.lines = snapshot.len();

        Ok(())
    }
}

/// An [`AnsiRenderer`] shared with other writers of the same terminal.
///
/// Anything printed through [`Console::suspend`] erases the progress block first, so it lands where the block was and the
/// next frame is painted below it, instead of being overwritten by the next repaint.
#[derive(Debug)]
pub struct Console<W> {
    renderer: Arc<Mutex<AnsiRenderer<W>>>,
}

impl<W> Clone for Console<W> {
    fn clone(&self) -> Self {
        Self {
            renderer: self.renderer.clone(),
        }
    }
}

impl<W: Write + Send> Console<W> {
    pub fn new(out: W) -> Self {
        Self {
            renderer: Arc::new(Mutex::new(AnsiRenderer::new(out))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AnsiRenderer<W>> {
        self.renderer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the progress block, then run `f` with the console output while no frame can be painted.
    pub fn suspend<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        let mut renderer = self.lock();

        if let Err(err) = renderer.render(&[]) {
            // not through tracing, whose writer may be this console
            let _ = writeln!(io::stderr(), "Cannot clear progress: {err}");
        }

        f(&mut renderer.out)
    }

    /// A [`MakeWriter`] printing log lines to stderr above the progress block.
    pub fn log_writer(&self) -> LogWriter<W> {
        LogWriter { console: self.clone() }
    }
}

impl<W: Write + Send> Render for Console<W> {
    fn render(&mut self, snapshot: &[(String, u8)]) -> io::Result<()> {
        self.lock().render(snapshot)
    }
}

/// Log output of a [`Console`].
#[derive(Debug)]
pub struct LogWriter<W> {
    console: Console<W>,
}

impl<'a, W: Write + Send + 'static> MakeWriter<'a> for LogWriter<W> {
    type Writer = LogLine<W>;

    fn make_writer(&'a self) -> Self::Writer {
        LogLine {
            console: self.console.clone(),
            buffer: Vec::new(),
        }
    }
}

/// One formatted log event, printed to stderr as a whole when dropped.
#[derive(Debug)]
pub struct LogLine<W: Write + Send> {
    console: Console<W>,
    buffer: Vec<u8>,
}

impl<W: Write + Send> Write for LogLine<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write + Send> Drop for LogLine<W> {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        self.console.suspend(|_| {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(&self.buffer);
            let _ = stderr.flush();
        });
    }
}

/// Fallback for outputs without ANSI support: one line per download, printed when it starts.
#[derive(Debug)]
pub struct PlainRenderer<W> {
    out: W,
    active: BTreeSet<String>,
}

impl<W: Write> PlainRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            active: BTreeSet::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Render for PlainRenderer<W> {
    fn render(&mut self, snapshot: &[(String, u8)]) -> io::Result<()> {
        let mut active = BTreeSet::new();

        for (key, _) in snapshot {
            if !self.active.contains(key) {
                writeln!(self.out, "Downloading {key}...")?;
            }
            active.insert(key.clone());
        }

        self.out.flush()?;
        self.active = active;

        Ok(())
    }
}

/// The periodic renderer task.
#[derive(Debug)]
pub struct Renderer {
    handle: tokio::task::JoinHandle<()>,
}

impl Renderer {
    /// Spawn a task repainting `registry` through `render` every `period` until `shutdown` is raised.
    ///
    /// A last empty frame is rendered on shutdown to clear the block. An output error stops the repainting but not the downloads.
    pub fn spawn(mut render: impl Render + 'static, registry: Registry, shutdown: Shutdown, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                if shutdown.is_triggered() {
                    break;
                }

                // the lock is released before formatting and writing anything
                let snapshot = registry.snapshot();

                if let Err(err) = render.render(&snapshot) {
                    tracing::warn!("Cannot render progress, giving up: {err}");
                    return;
                }
            }

            if let Err(err) = render.render(&[]) {
                tracing::warn!("Cannot clear progress: {err}");
            }
        });

        Self { handle }
    }

    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            tracing::error!("Renderer crashed: {err}");
        }
    }
}
