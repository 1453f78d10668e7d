//! SSH transport built on libssh2.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use ssh2::{Channel, ExtendedData, Session as SshSession};

use super::host_keys::HostKeyVerifier;
use super::{
    is_transient, ConnectParams, Connection, ConnectionHandle, ShellIo, Transport, TransportError,
};

/// Size of a single probe read performed by `data_ready`.
const PROBE_BUFFER_SIZE: usize = 4096;

/// Production transport: password-authenticated SSH with a PTY shell.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host_keys: HostKeyVerifier,
}

impl SshTransport {
    /// Creates a transport that verifies hosts with `host_keys`.
    pub fn new(host_keys: HostKeyVerifier) -> Self {
        Self { host_keys }
    }

    fn resolve(params: &ConnectParams) -> Result<SocketAddr, TransportError> {
        let address = params.address();
        (params.host.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve {
                address: address.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::Resolve {
                address,
                reason: "no addresses found".to_string(),
            })
    }

    /// Runs every step after the TCP connect. On error the caller
    /// disconnects the half-built session.
    fn establish(
        &self,
        session: &mut SshSession,
        params: &ConnectParams,
    ) -> Result<Channel, TransportError> {
        session
            .handshake()
            .map_err(|e| handshake_error(e, params))?;

        self.host_keys.verify(session, &params.host, params.port)?;

        if let Err(e) = session.userauth_password(&params.username, &params.password) {
            tracing::debug!(error = %e, "Password authentication rejected");
            return Err(TransportError::Auth {
                username: params.username.clone(),
            });
        }
        if !session.authenticated() {
            return Err(TransportError::Auth {
                username: params.username.clone(),
            });
        }

        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(|e| TransportError::Channel(format!("merge stderr: {e}")))?;
        channel
            .request_pty(&params.term, None, Some((params.cols, params.rows, 0, 0)))
            .map_err(|e| TransportError::Channel(format!("request PTY: {e}")))?;
        channel
            .shell()
            .map_err(|e| TransportError::Channel(format!("start shell: {e}")))?;

        Ok(channel)
    }
}

impl Transport for SshTransport {
    fn connect(&self, params: &ConnectParams) -> Result<Connection, TransportError> {
        let address = params.address();
        tracing::info!(
            host = %params.host,
            port = params.port,
            username = %params.username,
            "Connecting"
        );

        let addr = Self::resolve(params)?;
        let tcp = TcpStream::connect_timeout(&addr, params.timeout).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                TransportError::Timeout {
                    address: address.clone(),
                    after: params.timeout,
                }
            } else {
                TransportError::Tcp {
                    address: address.clone(),
                    source: e,
                }
            }
        })?;
        tcp.set_nodelay(true)?;

        let mut session =
            SshSession::new().map_err(|e| TransportError::Handshake(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(params.timeout.as_millis().min(u32::MAX as u128) as u32);

        let channel = match self.establish(&mut session, params) {
            Ok(channel) => channel,
            Err(e) => {
                // Dropping the session closes the socket; say goodbye first if we got that far.
                let _ = session.disconnect(None, "connect aborted", None);
                tracing::warn!(address = %address, error = %e, "Connect failed");
                return Err(e);
            }
        };

        session.set_blocking(false);
        tracing::info!(address = %address, "Shell channel open");

        Ok(Connection {
            link: Box::new(SshLink { session }),
            shell: Box::new(SshShell::new(channel)),
        })
    }
}

/// Classifies a handshake failure, keeping timeouts distinct.
fn handshake_error(err: ssh2::Error, params: &ConnectParams) -> TransportError {
    let message = err.to_string();
    if io::Error::from(err).kind() == io::ErrorKind::TimedOut {
        TransportError::Timeout {
            address: params.address(),
            after: params.timeout,
        }
    } else {
        TransportError::Handshake(message)
    }
}

/// Connection half of an SSH connection.
struct SshLink {
    session: SshSession,
}

impl ConnectionHandle for SshLink {
    fn disconnect(&mut self, reason: &str) -> io::Result<()> {
        // Disconnect is a single message; let it complete within the session timeout.
        self.session.set_blocking(true);
        self.session
            .disconnect(None, reason, None)
            .map_err(io::Error::from)
    }
}

/// Shell half of an SSH connection.
///
/// libssh2 only pulls packets off the socket inside a read call, so the
/// readiness probe performs a non-blocking read and stashes the result for
/// the following `read`.
struct SshShell {
    channel: Channel,
    stash: Vec<u8>,
    eof: bool,
}

impl SshShell {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            stash: Vec::with_capacity(PROBE_BUFFER_SIZE),
            eof: false,
        }
    }
}

impl ShellIo for SshShell {
    fn data_ready(&mut self) -> io::Result<bool> {
        if !self.stash.is_empty() || self.eof {
            return Ok(true);
        }

        let mut probe = [0u8; PROBE_BUFFER_SIZE];
        match self.channel.read(&mut probe) {
            Ok(0) => {
                if self.channel.eof() {
                    self.eof = true;
                    return Ok(true);
                }
                Ok(false)
            }
            Ok(n) => {
                self.stash.extend_from_slice(&probe[..n]);
                Ok(true)
            }
            Err(e) if is_transient(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.stash.is_empty() {
            let n = buf.len().min(self.stash.len());
            buf[..n].copy_from_slice(&self.stash[..n]);
            self.stash.drain(..n);
            return Ok(n);
        }
        if self.eof {
            return Ok(0);
        }
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.channel.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.channel.close() {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = io::Error::from(e);
                if is_transient(&e) {
                    // Close message queued; the disconnect that follows flushes it.
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}
