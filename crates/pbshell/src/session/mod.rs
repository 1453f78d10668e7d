//! Session management.
//!
//! - [`controller`]: the [`Session`] handle owning a live connection
//! - [`reader`]: the background reader thread
//! - [`fanout`]: single-producer broadcast of output to per-consumer queues
//! - [`lifecycle`]: reader lifecycle state machine

pub mod controller;
pub mod fanout;
pub mod lifecycle;
pub mod reader;

pub use controller::{Session, SessionError, SessionSettings};
pub use fanout::{OutputFanout, OutputReceiver, SubscriberId, SubscriberStats};
pub use lifecycle::{InvalidTransition, ReaderLifecycle, ReaderState};
pub use reader::{BackgroundReader, ExitReason, ReaderConfig, SharedShell};
