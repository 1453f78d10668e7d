//! Escalation command construction.

use crate::error::{ProtocolError, Result};

/// Default command used to switch to another remote identity.
pub const DEFAULT_ESCALATION_TEMPLATE: &str = "pbrun -u {target} bash";

/// Placeholder replaced by the target identity.
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// Builds the escalation command line, including the trailing newline.
///
/// The target is spliced into a shell command, so it must be a single
/// token: no whitespace, control characters or shell metacharacters.
pub fn escalation_command(template: &str, target: &str) -> Result<String> {
    if !template.contains(TARGET_PLACEHOLDER) {
        return Err(ProtocolError::InvalidTemplate(template.to_string()));
    }
    validate_target(target)?;
    Ok(format!("{}\n", template.replace(TARGET_PLACEHOLDER, target)))
}

fn validate_target(target: &str) -> Result<()> {
    let bad = |c: char| {
        c.is_whitespace()
            || c.is_control()
            || matches!(
                c,
                ';' | '&' | '|' | '`' | '$' | '<' | '>' | '(' | ')' | '\'' | '"' | '\\'
            )
    };
    if target.is_empty() || target.chars().any(bad) {
        return Err(ProtocolError::InvalidTarget(target.to_string()));
    }
    Ok(())
}
