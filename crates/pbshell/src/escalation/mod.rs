//! Privilege escalation.
//!
//! [`Session::escalate`] sends the identity-switch command and starts a
//! [`PromptWait`] that answers the resulting password prompt.

pub mod prompt_wait;

use pbshell_protocol::{escalation_command, Notice, ProtocolError, DEFAULT_ESCALATION_TEMPLATE};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

pub use prompt_wait::{CommandSink, PromptWait, PromptWaitConfig, PromptWaitState};

use crate::session::Session;

/// Escalation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationConfig {
    /// Command template containing `{target}`.
    pub command_template: String,
    /// Prompt-wait timing.
    pub prompt_wait: PromptWaitConfig,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            command_template: DEFAULT_ESCALATION_TEMPLATE.to_string(),
            prompt_wait: PromptWaitConfig::default(),
        }
    }
}

/// Reasons an escalation could not start.
#[derive(Error, Debug)]
pub enum EscalationError {
    /// The target or template is unusable.
    #[error(transparent)]
    Command(#[from] ProtocolError),

    /// There is no live shell to escalate in.
    #[error("not connected")]
    NotConnected,
}

/// A running escalation.
#[derive(Debug)]
pub struct EscalationHandle {
    task: JoinHandle<PromptWaitState>,
}

impl EscalationHandle {
    /// Waits for the prompt-wait to reach its terminal state.
    pub async fn outcome(self) -> Result<PromptWaitState, JoinError> {
        self.task.await
    }

    /// Returns true once the prompt-wait has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops watching without sending anything further.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Session {
    /// Switches the remote shell to `target` and answers its password
    /// prompt with `secondary_password`.
    ///
    /// Must be called from within a tokio runtime. The watcher subscribes
    /// before the command is sent. An empty `secondary_password` means the
    /// prompt is reported but never answered.
    pub fn escalate(
        &self,
        target: &str,
        secondary_password: &str,
    ) -> Result<EscalationHandle, EscalationError> {
        let config = self.settings().escalation.clone();
        let command = escalation_command(&config.command_template, target)?;

        if !self.is_connected() {
            self.output().push_notice(&Notice::not_connected());
            return Err(EscalationError::NotConnected);
        }

        let watcher = PromptWait::new(
            self.subscribe("prompt-wait"),
            self.output().clone(),
            self.clone(),
            secondary_password,
            config.prompt_wait,
        )
        .with_session_state(self.state_changes());

        tracing::info!(session_id = %self.id(), target = %target, "Escalating");
        let sink = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = tokio::task::spawn_blocking(move || sink.send(&command)).await {
                tracing::warn!(error = %e, "Escalation command send task failed");
            }
            watcher.run().await
        });

        Ok(EscalationHandle { task })
    }
}
