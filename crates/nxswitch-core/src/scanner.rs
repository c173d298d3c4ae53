//! Incremental line buffering with switch-command detection.
//!
//! Input from a scanned source is held until complete lines are available.
//! Complete lines are handed back to the caller unchanged, except for the
//! switch command line, which is removed and parsed.
//!
//! All input is expected to be newline-terminated. A switch command that has
//! not yet received its terminator stays in the buffer and is only detected
//! once the terminator arrives.

use crate::command::{parse_switch_command, SWITCH_COMMAND};
use crate::decision::SwitchDecision;
use crate::dump;
use crate::error::{SwitchError, SwitchResult};
use tracing::{debug, error};

/// Buffered bytes plus a new chunk must stay below this size.
pub const INPUT_BUFFER_LIMIT: usize = 16 * 1024 - 1;

fn is_terminator(byte: u8) -> bool {
    matches!(byte, b'\n' | b'\r' | b'\0')
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Result of feeding one chunk into an [`InputBuffer`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Complete lines, terminators included, to forward as regular input.
    pub passthrough: Vec<u8>,
    /// The decision parsed from a switch command found in this call.
    pub decision: Option<SwitchDecision>,
}

/// Per-source buffer used while waiting for the switch command.
#[derive(Debug, Default)]
pub struct InputBuffer {
    buffer: Vec<u8>,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk and return the complete lines ready to be forwarded, up
    /// to `limit` bytes, together with the switch decision if the command
    /// was completed by this chunk.
    ///
    /// Fails without touching the buffer if the pending input would reach
    /// [`INPUT_BUFFER_LIMIT`], and fails with a parse error if a terminated
    /// switch command is malformed.
    pub fn append(&mut self, chunk: &[u8], limit: usize) -> SwitchResult<ScanOutcome> {
        let pending = self.buffer.len() + chunk.len();
        if pending >= INPUT_BUFFER_LIMIT {
            error!(
                pending,
                limit = INPUT_BUFFER_LIMIT + 1,
                "buffer length exceeded, binary data can't be scanned"
            );
            return Err(SwitchError::BufferOverflow {
                len: pending,
                limit: INPUT_BUFFER_LIMIT,
            });
        }

        debug!(len = chunk.len(), "adding bytes to the temporary buffer");
        self.buffer.extend_from_slice(chunk);
        dump::dump_bytes("temporary buffer", &self.buffer);

        let decision = self.take_switch_command()?;
        let passthrough = self.drain_lines(limit);

        debug!(
            returned = passthrough.len(),
            left = self.buffer.len(),
            "scanned input chunk"
        );

        Ok(ScanOutcome {
            passthrough,
            decision,
        })
    }

    /// Remove and parse a terminated switch command, if one is buffered.
    fn take_switch_command(&mut self) -> SwitchResult<Option<SwitchDecision>> {
        let Some(start) = find(&self.buffer, SWITCH_COMMAND.as_bytes()) else {
            return Ok(None);
        };
        debug!(position = start, "switch command maybe found");

        let Some(length) = self.buffer[start..].iter().position(|&b| is_terminator(b)) else {
            debug!(position = start, "switch command not terminated yet");
            return Ok(None);
        };
        let end = start + length;

        let decision = parse_switch_command(&self.buffer[start..end])?;
        self.buffer.drain(start..=end);
        dump::dump_bytes("temporary buffer after removing the command", &self.buffer);

        Ok(Some(decision))
    }

    /// Move complete lines from the front of the buffer while they fit in `limit`.
    fn drain_lines(&mut self, limit: usize) -> Vec<u8> {
        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..]
            .iter()
            .position(|&b| is_terminator(b))
        {
            let line_len = offset + 1;
            if consumed + line_len > limit {
                break;
            }
            consumed += line_len;
        }
        self.buffer.drain(..consumed).collect()
    }

    /// Number of bytes waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
