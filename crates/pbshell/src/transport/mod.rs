//! Transport connector.
//!
//! This module defines the seam between the session controller and the
//! wire: a [`Transport`] establishes an authenticated connection and opens
//! one interactive shell, returning a [`Connection`] whose two halves are
//! owned by the controller. [`ssh::SshTransport`] is the production
//! implementation; tests substitute scripted transports.

pub mod host_keys;
pub mod ssh;

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

pub use host_keys::{HostKeyPolicy, HostKeyVerifier};
pub use ssh::SshTransport;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while establishing a connection.
///
/// These are the only errors surfaced synchronously to the caller; once a
/// shell is live, failures travel as notices on the output stream.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The host name could not be resolved.
    #[error("could not resolve {address}: {reason}")]
    Resolve { address: String, reason: String },

    /// The TCP connection failed.
    #[error("TCP connect to {address} failed: {source}")]
    Tcp {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The connection attempt exceeded its deadline.
    #[error("connection to {address} timed out after {}s", .after.as_secs())]
    Timeout { address: String, after: Duration },

    /// The SSH protocol handshake failed.
    #[error("SSH handshake failed: {0}")]
    Handshake(String),

    /// The host key was not accepted by the configured policy.
    #[error("host key for {host} rejected: {reason}")]
    HostKeyRejected { host: String, reason: String },

    /// The host presented a key different from the recorded one.
    #[error("host key mismatch for {host} (presented {fingerprint}); possible man-in-the-middle")]
    HostKeyMismatch { host: String, fingerprint: String },

    /// The server refused the credentials.
    #[error("authentication failed for user {username}")]
    Auth { username: String },

    /// The shell channel could not be opened.
    #[error("failed to open shell channel: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Parameters for one connect attempt.
#[derive(Clone)]
pub struct ConnectParams {
    /// Remote host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Transport username.
    pub username: String,
    /// Transport password.
    pub password: String,
    /// Upper bound on each blocking step of the connect.
    pub timeout: Duration,
    /// Terminal type requested for the PTY.
    pub term: String,
    /// PTY width in columns.
    pub cols: u32,
    /// PTY height in rows.
    pub rows: u32,
}

impl ConnectParams {
    /// Creates parameters with the default port, timeout and PTY shape.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: password.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connect timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the PTY terminal type and size.
    pub fn with_pty(mut self, term: impl Into<String>, cols: u32, rows: u32) -> Self {
        self.term = term.into();
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("term", &self.term)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}

/// Interactive shell channel with zero-wait read semantics.
///
/// Implementations never block in [`data_ready`](ShellIo::data_ready) or
/// [`read`](ShellIo::read): "nothing available" is reported as `Ok(false)`
/// or a would-block error respectively.
pub trait ShellIo: Send {
    /// Returns true when a read would return data or end-of-stream.
    fn data_ready(&mut self) -> io::Result<bool>;

    /// Reads available bytes. `Ok(0)` means the remote closed the shell.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes as much of `data` as the channel accepts right now.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Flushes buffered writes.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Closes the shell channel.
    fn close(&mut self) -> io::Result<()>;
}

/// The authenticated connection underneath a shell.
pub trait ConnectionHandle: Send {
    /// Tears down the connection.
    fn disconnect(&mut self, reason: &str) -> io::Result<()>;
}

/// A freshly established connection and its interactive shell.
pub struct Connection {
    /// Connection handle.
    pub link: Box<dyn ConnectionHandle>,
    /// Shell channel handle.
    pub shell: Box<dyn ShellIo>,
}

/// Establishes connections.
///
/// `connect` blocks for at most the configured timeout per step and must
/// release any partially created resources before returning an error.
pub trait Transport: Send + Sync + 'static {
    /// Connects, authenticates and opens an interactive PTY shell.
    fn connect(&self, params: &ConnectParams) -> Result<Connection, TransportError>;
}

/// Returns true for I/O errors that only mean "try again later".
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_params_defaults() {
        let params = ConnectParams::new("db01", "alice", "secret");
        assert_eq!(params.port, 22);
        assert_eq!(params.timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(params.address(), "db01:22");
        assert_eq!((params.cols, params.rows), (80, 24));
    }

    #[test]
    fn test_connect_params_builders() {
        let params = ConnectParams::new("db01", "alice", "secret")
            .with_port(2222)
            .with_timeout(Duration::from_secs(3))
            .with_pty("vt100", 132, 43);
        assert_eq!(params.address(), "db01:2222");
        assert_eq!(params.timeout, Duration::from_secs(3));
        assert_eq!(params.term, "vt100");
        assert_eq!((params.cols, params.rows), (132, 43));
    }

    #[test]
    fn test_debug_redacts_password() {
        let params = ConnectParams::new("db01", "alice", "hunter2");
        let debug = format!("{params:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_error_descriptions_are_non_empty() {
        let err = TransportError::Auth {
            username: "alice".to_string(),
        };
        assert_eq!(err.to_string(), "authentication failed for user alice");

        let err = TransportError::Timeout {
            address: "db01:22".to_string(),
            after: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "connection to db01:22 timed out after 10s");
    }
}
