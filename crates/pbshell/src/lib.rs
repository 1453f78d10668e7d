//! # pbshell
//!
//! Interactive remote shell sessions with timed privilege escalation.
//!
//! ## Overview
//!
//! pbshell opens a password-authenticated SSH connection, starts a PTY
//! shell, and keeps it alive with a background reader while consumers
//! receive the output. It can switch the remote shell to another identity
//! (`pbrun -u <target> bash` by default) and answer the resulting password
//! prompt automatically within a bounded window.
//!
//! - **Transport**: SSH connect, host key policy, PTY shell (libssh2)
//! - **Session**: connect, send and idempotent close over one live shell
//! - **Reader**: non-blocking polling thread feeding the output stream
//! - **Fan-out**: every consumer gets its own ordered copy of the stream
//! - **Escalation**: prompt-wait automation with at most one credential send
//! - **Relay**: periodic drain of a subscription into a display surface
//!
//! ## Architecture
//!
//! ```text
//!   remote shell ──► BackgroundReader ──► OutputFanout ──┬──► ConsumerRelay ──► stdout
//!        ▲              (thread)            ▲            └──► PromptWait
//!        │                                  │ notices              │
//!        └──────────── Session::send ◄──────┴──────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pbshell::{Config, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let session = Session::from_config(&config);
//!     let mut output = session.subscribe("example");
//!
//!     let params = config.connect_params("db01", None, "alice", "secret", None);
//!     session.connect(params).await?;
//!
//!     let escalation = session.escalate("appadm", "app-secret")?;
//!     println!("{:?}", escalation.outcome().await?);
//!
//!     session.send("whoami\n");
//!     if let Some(chunk) = output.recv().await {
//!         print!("{chunk}");
//!     }
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration
//! - [`transport`]: connection establishment and the shell I/O seam
//! - [`session`]: session controller, reader, fan-out, lifecycle
//! - [`escalation`]: escalation command and prompt-wait
//! - [`relay`]: display relay
//! - [`logging`]: tracing setup

pub mod config;
pub mod escalation;
pub mod logging;
pub mod relay;
pub mod session;
pub mod transport;

pub use config::{Config, ConfigError};
pub use escalation::{EscalationError, EscalationHandle, PromptWaitState};
pub use relay::{ConsumerRelay, DisplaySurface, StdoutSurface};
pub use session::{OutputReceiver, ReaderState, Session, SessionError};
pub use transport::{ConnectParams, HostKeyPolicy, TransportError};

pub use pbshell_protocol::{Notice, NoticeKind};
