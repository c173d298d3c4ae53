//! The SSH channel as seen by the switch.
//!
//! A channel owns a pair of descriptors that the switch may replace in
//! place with `dup2`, a kind tag, and its own scan buffer for spotting the
//! switch command in data arriving on it.

use nxswitch_core::{InputBuffer, ScanOutcome, SwitchResult};
use std::os::fd::RawFd;
use tracing::debug;

const AGENT_CHANNEL_TYPE: &str = "authentication agent connection";

/// Channel type, as announced by the SSH layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    /// Agent forwarding; its traffic is never scanned.
    AuthAgent,
    Other(String),
}

impl ChannelKind {
    /// Classify the free-form channel type string.
    pub fn from_ctype(ctype: &str) -> Self {
        match ctype {
            AGENT_CHANNEL_TYPE => ChannelKind::AuthAgent,
            "session" => ChannelKind::Session,
            other => ChannelKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct Channel {
    pub read_fd: RawFd,
    pub write_fd: RawFd,
    pub kind: ChannelKind,
    input: InputBuffer,
}

impl Channel {
    pub fn new(read_fd: RawFd, write_fd: RawFd, kind: ChannelKind) -> Self {
        Self {
            read_fd,
            write_fd,
            kind,
            input: InputBuffer::new(),
        }
    }

    /// Scan data received on the channel for the switch command.
    ///
    /// Agent channels bypass scanning: the data is returned unchanged and no
    /// decision is ever produced.
    pub fn check_input(&mut self, data: &[u8], limit: usize) -> SwitchResult<ScanOutcome> {
        if self.kind == ChannelKind::AuthAgent {
            debug!(len = data.len(), "not checking data on agent channel");
            return Ok(ScanOutcome {
                passthrough: data.to_vec(),
                decision: None,
            });
        }
        self.input.append(data, limit)
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending_input(&self) -> usize {
        self.input.pending()
    }
}
