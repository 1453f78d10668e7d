//! # pbshell Protocol Library
//!
//! Transport-agnostic vocabulary for the pbshell output stream.
//!
//! ## Overview
//!
//! Remote shell output and local diagnostics travel through one ordered
//! stream of text fragments. This crate defines what flows through it and
//! how it is interpreted, without doing any I/O:
//!
//! - **Notices**: tagged status and error messages interleaved with output
//! - **Decoding**: lossy UTF-8 decoding that survives split reads
//! - **Prompt matching**: cumulative detection of credential prompts
//! - **Escalation commands**: construction of the identity-switch command
//!
//! ## Example Usage
//!
//! ```rust
//! use pbshell_protocol::{escalation_command, Notice, PromptMatcher, Utf8StreamDecoder};
//!
//! let mut decoder = Utf8StreamDecoder::new();
//! let mut matcher = PromptMatcher::new();
//!
//! let cmd = escalation_command("pbrun -u {target} bash", "appadm").unwrap();
//! assert_eq!(cmd, "pbrun -u appadm bash\n");
//!
//! assert!(!matcher.feed(&decoder.decode(b"Pass")));
//! assert!(matcher.feed(&decoder.decode(b"word: ")));
//!
//! println!("{}", Notice::credential_sent());
//! ```
//!
//! ## Modules
//!
//! - [`notice`]: Notice kinds, rendering and parsing
//! - [`decode`]: Streaming tolerant UTF-8 decoder
//! - [`prompt`]: Prompt marker matching
//! - [`escalation`]: Escalation command builder
//! - [`error`]: Error types

pub mod decode;
pub mod error;
pub mod escalation;
pub mod notice;
pub mod prompt;

pub use decode::Utf8StreamDecoder;
pub use error::{ProtocolError, Result};
pub use escalation::{escalation_command, DEFAULT_ESCALATION_TEMPLATE, TARGET_PLACEHOLDER};
pub use notice::{Notice, NoticeKind};
pub use prompt::{PromptMatcher, PROMPT_MARKERS};
