//! Serial console transport and host terminal handling for vmrunner.
//!
//! Connects a host terminal (or a scripted caller) to a guest's serial
//! console over a named duplex channel: retrying open, full-duplex
//! forwarding, raw terminal input, line-ending normalization and
//! shell-prompt detection for one-shot commands.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod line_ending;
pub mod prompt;
pub mod session;
pub mod terminal;
pub mod transport;

pub use error::ConsoleError;
pub use line_ending::{normalize_line_endings, LineEndingNormalizer};
pub use prompt::{collect_until_prompt, wait_for_prompt, PromptScanner};
pub use session::{attach, exec_command, interactive_session, run_command, SessionOptions};
pub use terminal::HostInput;
pub use transport::{open_duplex, ChannelConnector, DefaultConnector};
