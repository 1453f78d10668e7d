//! Consumer relay.
//!
//! Drains one output subscription on a fixed cadence and hands the text to
//! a display surface. The relay never touches the connection, so a slow
//! surface only delays its own queue.

use std::io::{self, Write};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::OutputReceiver;

/// Default drain cadence.
pub const DEFAULT_RELAY_INTERVAL: Duration = Duration::from_millis(100);

/// Something that shows text to a user.
pub trait DisplaySurface {
    /// Appends text to the display.
    fn display(&mut self, text: &str) -> io::Result<()>;
}

/// Surface writing to a `Write` sink, flushing after each batch.
pub struct WriterSurface<W: Write> {
    writer: W,
}

impl<W: Write> WriterSurface<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> DisplaySurface for WriterSurface<W> {
    fn display(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.flush()
    }
}

/// Surface for the process's standard output.
pub type StdoutSurface = WriterSurface<io::Stdout>;

impl StdoutSurface {
    /// Creates a surface on stdout.
    pub fn stdout() -> Self {
        WriterSurface::new(io::stdout())
    }
}

/// Periodic drain of one subscription into one surface.
pub struct ConsumerRelay<S: DisplaySurface> {
    output: OutputReceiver,
    surface: S,
    interval: Duration,
}

impl<S: DisplaySurface> ConsumerRelay<S> {
    /// Creates a relay draining `output` every `interval`.
    pub fn new(output: OutputReceiver, surface: S, interval: Duration) -> Self {
        Self {
            output,
            surface,
            interval,
        }
    }

    /// Delivers every chunk queued right now, in order.
    ///
    /// Returns the number of chunks delivered; an empty queue is a no-op.
    pub fn drain_once(&mut self) -> usize {
        let chunks = self.output.drain();
        if chunks.is_empty() {
            return 0;
        }
        let batch = chunks.concat();
        if let Err(e) = self.surface.display(&batch) {
            tracing::warn!(error = %e, "Display surface rejected output");
        }
        chunks.len()
    }

    /// Drains on the configured cadence until `cancel` fires, then drains
    /// once more and returns the surface.
    pub async fn run(mut self, cancel: CancellationToken) -> S {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.drain_once();
                }
            }
        }

        self.drain_once();
        self.surface
    }
}
