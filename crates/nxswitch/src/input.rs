//! Scanning the process's standard input for the switch command.
//!
//! On the server side nothing but the command is expected on standard
//! input. Complete lines that arrive before it are logged and dropped.

use nxswitch_core::{dump, InputBuffer, SwitchDecision, SwitchError, SwitchResult, INPUT_BUFFER_LIMIT};
use std::io::{ErrorKind, Read};
use tracing::{debug, warn};

const READ_CHUNK: usize = 1023;

/// Read from `reader` until a switch command has been seen.
///
/// Fails with [`SwitchError::EndOfInput`] if the input ends first, and with
/// the scanner's error on a malformed command or an overflowing buffer.
/// A partial line left after a discarded line stays buffered so a command
/// split across reads is still found.
pub fn check_standard_input<R: Read>(
    reader: &mut R,
    scanner: &mut InputBuffer,
) -> SwitchResult<SwitchDecision> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let len = match reader.read(&mut chunk) {
            Ok(0) => {
                debug!(pending = scanner.pending(), "end of input");
                return Err(SwitchError::EndOfInput);
            }
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SwitchError::sys("read", e)),
        };

        let outcome = scanner.append(&chunk[..len], INPUT_BUFFER_LIMIT)?;
        if !outcome.passthrough.is_empty() {
            warn!(
                len = outcome.passthrough.len(),
                data = %dump::escape(&outcome.passthrough),
                "discarding spurious input"
            );
        }
        if let Some(decision) = outcome.decision {
            return Ok(decision);
        }
    }
}
