//! Trace-level dumps of buffered input and command strings.

use tracing::{enabled, trace, Level};

/// Longest escaped line emitted in one trace event.
const DUMP_LINE_WIDTH: usize = 135;

/// Render bytes as printable text, escaping control and non-ASCII bytes.
pub fn escape(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect()
}

/// Emit `bytes` at trace level, split into lines of bounded width, together
/// with their hex encoding.
pub fn dump_bytes(label: &str, bytes: &[u8]) {
    if !enabled!(Level::TRACE) {
        return;
    }
    trace!(label = %label, len = bytes.len(), hex = %hex::encode(bytes), "---");
    let text = escape(bytes);
    let chars: Vec<char> = text.chars().collect();
    for line in chars.chunks(DUMP_LINE_WIDTH) {
        let line: String = line.iter().collect();
        trace!("{line}");
    }
    trace!("---");
}
