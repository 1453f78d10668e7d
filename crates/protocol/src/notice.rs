//! Synthetic status notices interleaved with remote output.
//!
//! Every failure and status change reaches consumers through the same
//! ordered text stream as shell output. A notice is rendered as a
//! bracketed tag followed by a message, e.g. `[closed] connection closed
//! by remote`, so a consumer can tell diagnostics apart from remote text
//! without a second channel.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Class of a notice; each class has its own literal tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// Connection lifecycle and general status.
    Info,
    /// Local failures such as sending without a live shell.
    Error,
    /// The remote side ended the shell.
    Closed,
    /// Prompt-wait automation transitions.
    Escalation,
    /// Persistent read failures that forced the session closed.
    Io,
}

impl NoticeKind {
    /// Returns the tag text without brackets.
    pub fn tag(self) -> &'static str {
        match self {
            NoticeKind::Info => "info",
            NoticeKind::Error => "error",
            NoticeKind::Closed => "closed",
            NoticeKind::Escalation => "escalation",
            NoticeKind::Io => "io",
        }
    }
}

impl FromStr for NoticeKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(NoticeKind::Info),
            "error" => Ok(NoticeKind::Error),
            "closed" => Ok(NoticeKind::Closed),
            "escalation" => Ok(NoticeKind::Escalation),
            "io" => Ok(NoticeKind::Io),
            other => Err(ProtocolError::UnknownNoticeTag(other.to_string())),
        }
    }
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.tag())
    }
}

/// A status message destined for the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// The notice class.
    pub kind: NoticeKind,
    /// Human-readable message, without the tag.
    pub message: String,
}

impl Notice {
    /// Creates a notice of the given kind.
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Status notice.
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Info, message)
    }

    /// Local error notice.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Error, message)
    }

    /// The single notice emitted when the remote side closes the shell.
    pub fn closed_by_remote() -> Self {
        Self::new(NoticeKind::Closed, "connection closed by remote")
    }

    /// Emitted when `send` is called without a live shell.
    pub fn not_connected() -> Self {
        Self::error("not connected")
    }

    /// Prompt-wait reached the `sent` state.
    pub fn credential_sent() -> Self {
        Self::new(
            NoticeKind::Escalation,
            "password prompt detected, secondary credential sent",
        )
    }

    /// Prompt-wait reached the `no-credential` state.
    pub fn no_credential() -> Self {
        Self::new(
            NoticeKind::Escalation,
            "password prompt detected but no credential supplied",
        )
    }

    /// Prompt-wait saw the prompt but the shell was gone when the credential was written.
    pub fn credential_not_sent() -> Self {
        Self::new(
            NoticeKind::Escalation,
            "password prompt detected but secondary credential could not be sent",
        )
    }

    /// The session closed while prompt-wait was still watching.
    pub fn escalation_cancelled() -> Self {
        Self::new(
            NoticeKind::Escalation,
            "session closed before password prompt was detected",
        )
    }

    /// Prompt-wait reached the `expired` state.
    pub fn prompt_not_detected(window: Duration) -> Self {
        Self::new(
            NoticeKind::Escalation,
            format!("prompt not detected within {}s", window.as_secs()),
        )
    }

    /// The reader gave up after repeated hard read failures.
    pub fn read_failed(consecutive: u32, last_error: &str) -> Self {
        Self::new(
            NoticeKind::Io,
            format!("closing after {consecutive} consecutive read errors: {last_error}"),
        )
    }

    /// Renders the notice as a stream chunk on its own line.
    pub fn to_chunk(&self) -> String {
        format!("\n{self}\n")
    }

    /// Parses a rendered notice, tolerating surrounding whitespace.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let rest = trimmed
            .strip_prefix('[')
            .ok_or_else(|| ProtocolError::NotANotice(text.to_string()))?;
        let (tag, message) = rest
            .split_once(']')
            .ok_or_else(|| ProtocolError::NotANotice(text.to_string()))?;
        let kind = tag.parse()?;
        Ok(Self::new(kind, message.trim_start()))
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_notice_text() {
        assert_eq!(
            Notice::closed_by_remote().to_string(),
            "[closed] connection closed by remote"
        );
    }

    #[test]
    fn test_chunk_is_line_delimited() {
        let chunk = Notice::not_connected().to_chunk();
        assert!(chunk.starts_with('\n'));
        assert!(chunk.ends_with('\n'));
        assert!(chunk.contains("[error] not connected"));
    }

    #[test]
    fn test_prompt_not_detected_mentions_window() {
        let notice = Notice::prompt_not_detected(Duration::from_secs(8));
        assert_eq!(notice.kind, NoticeKind::Escalation);
        assert_eq!(notice.message, "prompt not detected within 8s");
    }

    #[test]
    fn test_escalation_outcomes_are_distinct() {
        let outcomes = [
            Notice::credential_sent(),
            Notice::credential_not_sent(),
            Notice::no_credential(),
            Notice::escalation_cancelled(),
        ];
        for (i, a) in outcomes.iter().enumerate() {
            assert_eq!(a.kind, NoticeKind::Escalation);
            for b in &outcomes[i + 1..] {
                assert_ne!(a.message, b.message);
            }
        }
    }

    #[test]
    fn test_parse_rendered_chunk() {
        let chunk = Notice::credential_sent().to_chunk();
        let parsed = Notice::parse(&chunk).unwrap();
        assert_eq!(parsed, Notice::credential_sent());
    }

    #[test]
    fn test_parse_rejects_plain_text() {
        assert!(matches!(
            Notice::parse("user@host:~$ "),
            Err(ProtocolError::NotANotice(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        assert_eq!(
            Notice::parse("[warn] something"),
            Err(ProtocolError::UnknownNoticeTag("warn".to_string()))
        );
    }

    #[test]
    fn test_tags_are_distinct() {
        let kinds = [
            NoticeKind::Info,
            NoticeKind::Error,
            NoticeKind::Closed,
            NoticeKind::Escalation,
            NoticeKind::Io,
        ];
        let tags: std::collections::HashSet<_> = kinds.iter().map(|k| k.tag()).collect();
        assert_eq!(tags.len(), kinds.len());
        for kind in kinds {
            assert_eq!(kind.tag().parse::<NoticeKind>().unwrap(), kind);
        }
    }
}
