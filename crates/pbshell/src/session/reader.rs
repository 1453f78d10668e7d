//! Background reader.
//!
//! One reader thread runs per live session. It polls the shell with
//! zero-wait reads, decodes whatever arrived and pushes it onto the output
//! fan-out. It is the only producer of remote-originated chunks, so remote
//! output reaches every subscriber in the order it was read.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use pbshell_protocol::{Notice, Utf8StreamDecoder};

use super::fanout::OutputFanout;
use crate::transport::{is_transient, ShellIo};

/// Shell handle shared between the controller (writes) and the reader.
pub type SharedShell = Arc<Mutex<Box<dyn ShellIo>>>;

/// Default number of bytes requested per read.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default sleep between empty polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default number of consecutive hard read errors tolerated.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Reader tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Maximum bytes per read.
    pub chunk_size: usize,
    /// Sleep when nothing is ready.
    pub poll_interval: Duration,
    /// Hard read errors in a row before the session is closed; 0 disables.
    pub max_consecutive_errors: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }
}

/// Why the reader loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The stop signal was raised.
    Stopped,
    /// A read returned zero bytes.
    RemoteClosed,
    /// Too many consecutive non-transient read errors.
    ReadErrors { count: u32, last_error: String },
}

/// Poll loop over one shell channel.
pub struct BackgroundReader {
    session_id: String,
    shell: SharedShell,
    stop: Arc<AtomicBool>,
    output: OutputFanout,
    config: ReaderConfig,
}

enum Poll {
    Data(usize),
    Eof,
    Idle,
}

impl BackgroundReader {
    /// Creates a reader; nothing runs until [`spawn`](Self::spawn) or [`run`](Self::run).
    pub fn new(
        session_id: impl Into<String>,
        shell: SharedShell,
        stop: Arc<AtomicBool>,
        output: OutputFanout,
        config: ReaderConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            shell,
            stop,
            output,
            config,
        }
    }

    /// Runs the reader on a dedicated named thread.
    ///
    /// `on_exit` is invoked exactly once on that thread, whatever ended the loop.
    pub fn spawn<F>(self, on_exit: F) -> io::Result<JoinHandle<ExitReason>>
    where
        F: FnOnce(&ExitReason) + Send + 'static,
    {
        let short_id: String = self.session_id.chars().take(8).collect();
        thread::Builder::new()
            .name(format!("pbshell-reader-{short_id}"))
            .spawn(move || self.run(on_exit))
    }

    /// Runs the loop on the current thread until it exits, then calls `on_exit`.
    pub fn run<F>(self, on_exit: F) -> ExitReason
    where
        F: FnOnce(&ExitReason),
    {
        tracing::debug!(session_id = %self.session_id, "Reader started");
        let reason = self.poll_loop();
        tracing::debug!(session_id = %self.session_id, reason = ?reason, "Reader exiting");
        on_exit(&reason);
        reason
    }

    fn poll_loop(&self) -> ExitReason {
        let mut decoder = Utf8StreamDecoder::new();
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut consecutive_errors = 0u32;

        loop {
            if self.stop.load(Ordering::Acquire) {
                return ExitReason::Stopped;
            }

            match self.poll_once(&mut buf) {
                Ok(Poll::Data(n)) => {
                    consecutive_errors = 0;
                    self.output.push(decoder.decode(&buf[..n]));
                }
                Ok(Poll::Eof) => {
                    self.output.push(decoder.finish());
                    tracing::info!(session_id = %self.session_id, "Remote closed the shell");
                    self.output.push_notice(&Notice::closed_by_remote());
                    return ExitReason::RemoteClosed;
                }
                Ok(Poll::Idle) => {
                    consecutive_errors = 0;
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) if is_transient(&e) => {
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        count = consecutive_errors,
                        "Shell read error"
                    );
                    let limit = self.config.max_consecutive_errors;
                    if limit > 0 && consecutive_errors >= limit {
                        let last_error = e.to_string();
                        self.output
                            .push_notice(&Notice::read_failed(consecutive_errors, &last_error));
                        return ExitReason::ReadErrors {
                            count: consecutive_errors,
                            last_error,
                        };
                    }
                    thread::sleep(self.config.poll_interval);
                }
            }
        }
    }

    /// One ready-check plus read, under a single short lock.
    fn poll_once(&self, buf: &mut [u8]) -> io::Result<Poll> {
        let mut shell = self.shell.lock();
        if !shell.data_ready()? {
            return Ok(Poll::Idle);
        }
        match shell.read(buf)? {
            0 => Ok(Poll::Eof),
            n => Ok(Poll::Data(n)),
        }
    }
}
