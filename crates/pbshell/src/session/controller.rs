//! Session controller.
//!
//! [`Session`] is the single owner of a live connection. It arms the
//! background reader after a successful connect, serializes writes to the
//! shell, and funnels both explicit closes and reader exits through one
//! teardown path guarded by the reader lifecycle.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pbshell_protocol::Notice;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use super::fanout::{OutputFanout, OutputReceiver};
use super::lifecycle::{ReaderLifecycle, ReaderState};
use super::reader::{BackgroundReader, ExitReason, ReaderConfig, SharedShell};
use crate::config::Config;
use crate::escalation::EscalationConfig;
use crate::transport::{
    is_transient, ConnectParams, Connection, ConnectionHandle, SshTransport, Transport,
    TransportError,
};

/// Backoff between write attempts while the channel is full.
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(2);

/// Errors returned by [`Session::connect`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// A connection is live or another connect is in flight.
    #[error("session is already connected")]
    AlreadyConnected,

    /// The transport could not establish the connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connect task or the reader thread could not be started.
    #[error("failed to start session worker: {0}")]
    Spawn(#[source] io::Error),
}

/// Tunables for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Background reader tuning.
    pub reader: ReaderConfig,
    /// Escalation command and prompt-wait tuning.
    pub escalation: EscalationConfig,
}

/// Everything that exists only while a connection is live.
struct Live {
    link: Box<dyn ConnectionHandle>,
    shell: SharedShell,
    stop: Arc<AtomicBool>,
    generation: u64,
    peer: String,
    write_timeout: Duration,
    reader: Option<JoinHandle<ExitReason>>,
}

struct Slot {
    lifecycle: ReaderLifecycle,
    live: Option<Live>,
}

struct Inner {
    id: String,
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    fanout: OutputFanout,
    generation: AtomicU64,
    connecting: AtomicBool,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ReaderState>,
}

/// Handle to one interactive remote shell session.
///
/// Cloning yields another handle to the same session. A session starts
/// empty, gains its handles only inside a successful
/// [`connect`](Session::connect), and can be reconnected after a close.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Creates an unconnected session using `transport`.
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
        let (state_tx, _) = watch::channel(ReaderState::Idle);
        let id = Uuid::new_v4().to_string();
        tracing::debug!(session_id = %id, "Created session");
        Self {
            inner: Arc::new(Inner {
                id,
                transport,
                settings,
                fanout: OutputFanout::new(),
                generation: AtomicU64::new(0),
                connecting: AtomicBool::new(false),
                slot: Mutex::new(Slot {
                    lifecycle: ReaderLifecycle::new(),
                    live: None,
                }),
                state_tx,
            }),
        }
    }

    /// Creates an unconnected SSH session configured from `config`.
    pub fn from_config(config: &Config) -> Self {
        let transport = SshTransport::new(config.host_key_verifier());
        Self::new(Arc::new(transport), config.session_settings())
    }

    /// Returns the session ID used in logs.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the session settings.
    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Returns the output fan-out; pushing to it interleaves with remote output.
    pub fn output(&self) -> &OutputFanout {
        &self.inner.fanout
    }

    /// Registers a new independent output consumer.
    pub fn subscribe(&self, label: impl Into<String>) -> OutputReceiver {
        self.inner.fanout.subscribe(label)
    }

    /// Current reader lifecycle state.
    pub fn state(&self) -> ReaderState {
        self.inner.slot.lock().lifecycle.state()
    }

    /// Watches lifecycle state changes.
    pub fn state_changes(&self) -> watch::Receiver<ReaderState> {
        self.inner.state_tx.subscribe()
    }

    /// Returns true while a shell is live.
    pub fn is_connected(&self) -> bool {
        self.inner.slot.lock().live.is_some()
    }

    /// Returns `host:port` of the live connection.
    pub fn peer(&self) -> Option<String> {
        self.inner
            .slot
            .lock()
            .live
            .as_ref()
            .map(|live| live.peer.clone())
    }

    /// Connects, authenticates, opens a PTY shell and starts the reader.
    ///
    /// The blocking handshake runs on the blocking pool. On error the
    /// session is left empty and may be connected again.
    pub async fn connect(&self, params: ConnectParams) -> Result<(), SessionError> {
        if self.inner.connecting.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyConnected);
        }
        let _guard = ConnectingGuard(&self.inner.connecting);
        if !self.state().can_connect() {
            return Err(SessionError::AlreadyConnected);
        }

        let transport = Arc::clone(&self.inner.transport);
        let attempt = params.clone();
        let connection = tokio::task::spawn_blocking(move || transport.connect(&attempt))
            .await
            .map_err(|e| SessionError::Spawn(io::Error::other(e.to_string())))?
            .inspect_err(|e| {
                tracing::warn!(session_id = %self.inner.id, error = %e, "Connect failed");
            })?;

        self.arm(connection, &params)
    }

    /// Stores the connection handles and starts the reader thread.
    fn arm(&self, connection: Connection, params: &ConnectParams) -> Result<(), SessionError> {
        let Connection { mut link, shell } = connection;
        let shell: SharedShell = Arc::new(Mutex::new(shell));
        let stop = Arc::new(AtomicBool::new(false));
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        // Held until the handles are stored, so a reader that exits at once
        // cannot tear down before there is anything to tear down.
        let mut slot = self.inner.slot.lock();
        if slot.lifecycle.transition(ReaderState::Running).is_err() {
            drop(slot);
            self.inner.release(&shell, link.as_mut(), "connect superseded");
            return Err(SessionError::AlreadyConnected);
        }

        let reader = BackgroundReader::new(
            self.inner.id.clone(),
            Arc::clone(&shell),
            Arc::clone(&stop),
            self.inner.fanout.clone(),
            self.inner.settings.reader.clone(),
        );
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let spawned = reader.spawn(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.teardown(Some(generation), &exit_message(reason));
            }
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let _ = slot.lifecycle.transition(ReaderState::Stopping);
                let _ = slot.lifecycle.transition(ReaderState::Stopped);
                drop(slot);
                self.inner.release(&shell, link.as_mut(), "reader failed to start");
                self.inner.publish(ReaderState::Stopped);
                return Err(SessionError::Spawn(e));
            }
        };

        slot.live = Some(Live {
            link,
            shell,
            stop,
            generation,
            peer: params.address(),
            write_timeout: params.timeout,
            reader: Some(handle),
        });
        drop(slot);

        self.inner.publish(ReaderState::Running);
        tracing::info!(
            session_id = %self.inner.id,
            peer = %params.address(),
            generation = generation,
            "Session connected"
        );
        self.inner
            .fanout
            .push_notice(&Notice::info(format!("connected to {}", params.address())));
        Ok(())
    }

    /// Writes raw text to the live shell.
    ///
    /// Never fails for the caller: without a shell, or when the write
    /// fails, a notice is pushed onto the output stream instead.
    pub fn send(&self, text: &str) {
        self.try_send(text);
    }

    /// Like [`send`](Session::send), but reports whether the text reached
    /// a live shell. Failures still produce notices.
    pub fn try_send(&self, text: &str) -> bool {
        let target = {
            let slot = self.inner.slot.lock();
            slot.live
                .as_ref()
                .map(|live| (Arc::clone(&live.shell), live.write_timeout))
        };
        let Some((shell, timeout)) = target else {
            self.inner.fanout.push_notice(&Notice::not_connected());
            return false;
        };

        match write_all(&shell, text.as_bytes(), timeout) {
            Ok(()) => {
                tracing::trace!(session_id = %self.inner.id, bytes = text.len(), "Sent to shell");
                true
            }
            Err(e) => {
                tracing::warn!(session_id = %self.inner.id, error = %e, "Send failed");
                self.inner
                    .fanout
                    .push_notice(&Notice::error(format!("send failed: {e}")));
                false
            }
        }
    }

    /// Closes the session. Idempotent; never fails for the caller.
    pub fn close(&self) {
        if !self.inner.teardown(None, "closed by user") {
            tracing::debug!(session_id = %self.inner.id, "Close on inactive session ignored");
        }
    }
}

impl Inner {
    /// Tears down the live connection, if any.
    ///
    /// `generation` is set when the reader initiates the teardown, so a
    /// reader of an older connection cannot close a newer one. Returns true
    /// if this call performed the teardown.
    fn teardown(&self, generation: Option<u64>, reason: &str) -> bool {
        let mut live = {
            let mut slot = self.slot.lock();
            let current = match &slot.live {
                Some(live) => live.generation,
                None => return false,
            };
            if generation.is_some_and(|g| g != current) {
                return false;
            }
            if let Err(e) = slot.lifecycle.transition(ReaderState::Stopping) {
                tracing::debug!(session_id = %self.id, error = %e, "Teardown skipped");
                return false;
            }
            match slot.live.take() {
                Some(live) => live,
                None => return false,
            }
        };
        self.publish(ReaderState::Stopping);

        live.stop.store(true, Ordering::Release);

        self.close_shell(&live.shell);

        if let Some(reader) = live.reader.take() {
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                tracing::error!(session_id = %self.id, "Reader thread panicked");
            }
        }

        self.disconnect_link(live.link.as_mut(), reason);

        if let Err(e) = self.slot.lock().lifecycle.transition(ReaderState::Stopped) {
            tracing::error!(session_id = %self.id, error = %e, "Lifecycle out of step");
        }
        self.publish(ReaderState::Stopped);

        tracing::info!(
            session_id = %self.id,
            peer = %live.peer,
            reason = %reason,
            "Session closed"
        );
        true
    }

    /// Closes handles of a connection that never went live.
    fn release(&self, shell: &SharedShell, link: &mut dyn ConnectionHandle, reason: &str) {
        self.close_shell(shell);
        self.disconnect_link(link, reason);
    }

    /// Closes the shell channel; a failure becomes a notice.
    fn close_shell(&self, shell: &SharedShell) {
        let result = shell.lock().close();
        if let Err(e) = result {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to close shell channel");
            self.fanout
                .push_notice(&Notice::error(format!("close failed: shell channel: {e}")));
        }
    }

    /// Disconnects the connection; a failure becomes a notice.
    fn disconnect_link(&self, link: &mut dyn ConnectionHandle, reason: &str) {
        if let Err(e) = link.disconnect(reason) {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to disconnect");
            self.fanout
                .push_notice(&Notice::error(format!("close failed: connection: {e}")));
        }
    }

    fn publish(&self, state: ReaderState) {
        self.state_tx.send_replace(state);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.teardown(None, "session dropped");
    }
}

/// Clears the in-flight connect flag when the attempt ends.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn exit_message(reason: &ExitReason) -> String {
    match reason {
        ExitReason::Stopped => "reader stopped".to_string(),
        ExitReason::RemoteClosed => "remote closed the shell".to_string(),
        ExitReason::ReadErrors { count, .. } => format!("{count} consecutive read errors"),
    }
}

/// Writes all of `data`, retrying while the channel reports would-block.
fn write_all(shell: &SharedShell, mut data: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !data.is_empty() {
        // Lock per attempt so the reader is not starved during backoff.
        let result = shell.lock().write(data);
        match result {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "shell accepted no data",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(e) if is_transient(&e) => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("write stalled for {}s", timeout.as_secs()),
                    ));
                }
                thread::sleep(WRITE_RETRY_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }

    match shell.lock().flush() {
        Err(e) if !is_transient(&e) => Err(e),
        _ => Ok(()),
    }
}
