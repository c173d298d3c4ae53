//! The parsed outcome of a switch command.
//!
//! A [`SwitchDecision`] is produced exactly once by the command parser and is
//! read-only afterwards: establishment, authentication and forwarding all
//! receive it by reference.

use serde::{Serialize, Serializer};
use std::fmt;

/// A raw descriptor number as carried in the switch command.
pub type Descriptor = i32;

/// Explicit mode requested for an internal connection.
///
/// `default` and `encrypted` both mean "no explicit mode" and are represented
/// by `None` in [`SwitchDecision::Internal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalMode {
    Unencrypted,
}

/// Where the channel should be switched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SwitchDecision {
    /// TCP connection to an external proxy process.
    External {
        host: String,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        cookie: Option<String>,
        #[serde(rename = "in", skip_serializing_if = "Option::is_none")]
        input: Option<Descriptor>,
        #[serde(rename = "out", skip_serializing_if = "Option::is_none")]
        output: Option<Descriptor>,
    },
    /// Tie two pre-existing descriptors onto the channel.
    ForwardDescriptors {
        #[serde(rename = "in")]
        input: Descriptor,
        #[serde(rename = "out")]
        output: Descriptor,
    },
    /// Listen on `port` and bridge the single connection accepted from `accept_host`.
    ForwardPort { port: u16, accept_host: String },
    /// Local pipe handed to the embedded transport library.
    Internal {
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<InternalMode>,
        /// Passed to the transport library byte for byte.
        #[serde(
            skip_serializing_if = "Option::is_none",
            serialize_with = "serialize_options"
        )]
        options: Option<Vec<u8>>,
    },
}

impl SwitchDecision {
    /// Whether this is an internal connection running without encryption.
    pub fn is_unencrypted(&self) -> bool {
        matches!(
            self,
            SwitchDecision::Internal {
                mode: Some(InternalMode::Unencrypted),
                ..
            }
        )
    }

    /// The `in`/`out` descriptor pair, if both were given.
    pub fn descriptors(&self) -> Option<(Descriptor, Descriptor)> {
        match self {
            SwitchDecision::External {
                input: Some(i),
                output: Some(o),
                ..
            } => Some((*i, *o)),
            SwitchDecision::ForwardDescriptors { input, output } => Some((*input, *output)),
            _ => None,
        }
    }

    /// The authentication cookie for an external proxy, if any.
    pub fn cookie(&self) -> Option<&str> {
        match self {
            SwitchDecision::External { cookie, .. } => cookie.as_deref(),
            _ => None,
        }
    }
}

fn serialize_options<S: Serializer>(options: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match options {
        Some(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
        None => serializer.serialize_none(),
    }
}

impl fmt::Display for SwitchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchDecision::External { host, port, .. } => write!(f, "external {host}:{port}"),
            SwitchDecision::ForwardDescriptors { input, output } => {
                write!(f, "descriptors in: {input} out: {output}")
            }
            SwitchDecision::ForwardPort { port, accept_host } => {
                write!(f, "port: {port} accept: {accept_host}")
            }
            SwitchDecision::Internal { mode, .. } => match mode {
                Some(InternalMode::Unencrypted) => write!(f, "internal unencrypted"),
                None => write!(f, "internal"),
            },
        }
    }
}
