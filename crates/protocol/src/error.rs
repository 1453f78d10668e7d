//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering malformed stream vocabulary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The escalation target identity is unusable in a command line.
    #[error("invalid escalation target: {0:?}")]
    InvalidTarget(String),

    /// The escalation command template lacks a `{target}` placeholder.
    #[error("escalation template must contain {{target}}: {0:?}")]
    InvalidTemplate(String),

    /// A bracketed tag did not name a known notice kind.
    #[error("unknown notice tag: {0}")]
    UnknownNoticeTag(String),

    /// The text is not a rendered notice at all.
    #[error("not a notice: {0:?}")]
    NotANotice(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_target_display() {
        let err = ProtocolError::InvalidTarget("a b".to_string());
        assert_eq!(err.to_string(), "invalid escalation target: \"a b\"");
    }

    #[test]
    fn test_invalid_template_display() {
        let err = ProtocolError::InvalidTemplate("pbrun bash".to_string());
        assert_eq!(
            err.to_string(),
            "escalation template must contain {target}: \"pbrun bash\""
        );
    }

    #[test]
    fn test_unknown_tag_display() {
        let err = ProtocolError::UnknownNoticeTag("warn".to_string());
        assert_eq!(err.to_string(), "unknown notice tag: warn");
    }
}
