//! nxswitch-core: switch-command detection and parsing.
//!
//! Provides the incremental input scanner that spots the
//! `NX> 299 Switch connection to: ` control line inside a live byte stream,
//! the ordered grammar parser that turns that line into a [`SwitchDecision`],
//! and the error types shared with the I/O half of the proxy.

pub mod command;
pub mod decision;
pub mod dump;
pub mod error;
pub mod scanner;

// Re-export commonly used items at crate root.
pub use command::{parse_switch_command, MAX_COMMAND_LEN, SWITCH_COMMAND};
pub use decision::{Descriptor, InternalMode, SwitchDecision};
pub use error::{ParseError, SwitchError, SwitchResult};
pub use scanner::{InputBuffer, ScanOutcome, INPUT_BUFFER_LIMIT};
