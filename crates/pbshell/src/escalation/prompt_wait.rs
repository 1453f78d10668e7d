//! Time-boxed credential prompt watcher.
//!
//! After the escalation command is sent, the watcher reads its own
//! subscription to the session output until a prompt marker appears or the
//! deadline passes. It sends the secondary credential at most once and
//! reports each transition with exactly one `[escalation]` notice. When
//! given the session's state channel it also stops early once the session
//! begins closing.

use std::fmt;
use std::time::Duration;

use pbshell_protocol::{Notice, PromptMatcher};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::session::{OutputFanout, OutputReceiver, ReaderState, Session};

/// Default prompt-wait window.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(8);

/// Default upper bound on a single wait for the next chunk.
pub const DEFAULT_PROMPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State of one prompt-wait activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptWaitState {
    /// Scanning output for a prompt.
    Watching,
    /// Prompt seen; the secondary credential was sent.
    Sent,
    /// Prompt seen; the credential could not be written to the shell.
    SendFailed,
    /// Prompt seen; no secondary credential was configured.
    NoCredential,
    /// Deadline passed without a prompt.
    Expired,
    /// Session closed before a prompt appeared.
    Cancelled,
}

impl PromptWaitState {
    /// Returns true once scanning has stopped.
    pub fn is_terminal(self) -> bool {
        !matches!(self, PromptWaitState::Watching)
    }
}

impl fmt::Display for PromptWaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromptWaitState::Watching => "watching",
            PromptWaitState::Sent => "sent",
            PromptWaitState::SendFailed => "send-failed",
            PromptWaitState::NoCredential => "no-credential",
            PromptWaitState::Expired => "expired",
            PromptWaitState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Prompt-wait timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptWaitConfig {
    /// Window in which the prompt must appear.
    pub timeout: Duration,
    /// Longest single wait for the next chunk.
    pub poll_interval: Duration,
}

impl Default for PromptWaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROMPT_TIMEOUT,
            poll_interval: DEFAULT_PROMPT_POLL_INTERVAL,
        }
    }
}

/// Where the watcher sends the credential.
pub trait CommandSink: Clone + Send + Sync + 'static {
    /// Writes text to the remote shell. May block briefly.
    ///
    /// Returns false when nothing reached a live shell.
    fn send(&self, text: &str) -> bool;
}

impl CommandSink for Session {
    fn send(&self, text: &str) -> bool {
        self.try_send(text)
    }
}

/// What one pass of the watch loop observed.
enum Step {
    Chunk(String),
    Drained,
    Idle,
    SessionEnded,
}

/// Resolves once the session starts closing. Never resolves without a channel.
async fn session_ended(state: Option<&mut watch::Receiver<ReaderState>>) {
    match state {
        Some(rx) => {
            // A dropped sender also means the session is gone.
            let _ = rx
                .wait_for(|s| matches!(s, ReaderState::Stopping | ReaderState::Stopped))
                .await;
        }
        None => std::future::pending().await,
    }
}

/// One prompt-wait activation.
pub struct PromptWait<S: CommandSink> {
    output: OutputReceiver,
    notices: OutputFanout,
    sink: S,
    secondary: Option<String>,
    config: PromptWaitConfig,
    matcher: PromptMatcher,
    state: PromptWaitState,
    session_state: Option<watch::Receiver<ReaderState>>,
}

impl<S: CommandSink> PromptWait<S> {
    /// Creates a watcher over `output`.
    ///
    /// `output` must be subscribed before the escalation command is sent,
    /// or a fast prompt could be missed. An empty `secondary` counts as no
    /// credential.
    pub fn new(
        output: OutputReceiver,
        notices: OutputFanout,
        sink: S,
        secondary: &str,
        config: PromptWaitConfig,
    ) -> Self {
        Self {
            output,
            notices,
            sink,
            secondary: (!secondary.is_empty()).then(|| secondary.to_string()),
            config,
            matcher: PromptMatcher::new(),
            state: PromptWaitState::Watching,
            session_state: None,
        }
    }

    /// Ends the watch as [`PromptWaitState::Cancelled`] once `state` reports
    /// the session stopping or stopped.
    pub fn with_session_state(mut self, state: watch::Receiver<ReaderState>) -> Self {
        self.session_state = Some(state);
        self
    }

    /// Current state.
    pub fn state(&self) -> PromptWaitState {
        self.state
    }

    /// Watches until a terminal state is reached and returns it.
    pub async fn run(mut self) -> PromptWaitState {
        let deadline = Instant::now() + self.config.timeout;

        while !self.state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                tracing::info!(timeout_secs = self.config.timeout.as_secs(), "Prompt not detected");
                self.finish(
                    PromptWaitState::Expired,
                    Notice::prompt_not_detected(self.config.timeout),
                );
                break;
            }

            let wait = (deadline - now).min(self.config.poll_interval);
            // Queued output wins over the close signal so a prompt that
            // arrived just before the close is still answered.
            let step = tokio::select! {
                biased;
                received = tokio::time::timeout(wait, self.output.recv()) => match received {
                    Ok(Some(chunk)) => Step::Chunk(chunk),
                    Ok(None) => Step::Drained,
                    Err(_) => Step::Idle,
                },
                _ = session_ended(self.session_state.as_mut()) => Step::SessionEnded,
            };

            match step {
                Step::Chunk(chunk) => {
                    if self.matcher.feed(&chunk) {
                        self.on_prompt().await;
                    }
                }
                // Output ended; nothing more can arrive before the deadline.
                Step::Drained => tokio::time::sleep_until(deadline).await,
                Step::Idle => {}
                Step::SessionEnded => {
                    tracing::info!("Session closed while waiting for prompt");
                    self.finish(PromptWaitState::Cancelled, Notice::escalation_cancelled());
                }
            }
        }

        self.notices.unsubscribe(self.output.id());
        self.state
    }

    async fn on_prompt(&mut self) {
        match self.secondary.take() {
            Some(secret) => {
                let sink = self.sink.clone();
                let line = format!("{secret}\n");
                let delivered = match tokio::task::spawn_blocking(move || sink.send(&line)).await {
                    Ok(delivered) => delivered,
                    Err(e) => {
                        tracing::warn!(error = %e, "Credential send task failed");
                        false
                    }
                };
                if delivered {
                    tracing::info!("Prompt detected; secondary credential sent");
                    self.finish(PromptWaitState::Sent, Notice::credential_sent());
                } else {
                    tracing::warn!("Prompt detected; secondary credential not sent");
                    self.finish(PromptWaitState::SendFailed, Notice::credential_not_sent());
                }
            }
            None => {
                tracing::info!("Prompt detected without a secondary credential");
                self.finish(PromptWaitState::NoCredential, Notice::no_credential());
            }
        }
    }

    fn finish(&mut self, state: PromptWaitState, notice: Notice) {
        self.state = state;
        self.notices.push_notice(&notice);
    }
}
