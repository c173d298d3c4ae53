use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced while turning a control line into a switch decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty switch command")]
    Empty,

    #[error("switch command of {0} bytes is too long")]
    TooLong(usize),

    #[error("no switch grammar matches the command")]
    Unrecognized,

    #[error("not supported mode: {0}")]
    UnsupportedMode(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Errors produced by the switch machinery.
///
/// Every variant except [`SwitchError::Io`] is terminal for the switch: the
/// host is expected to log it and exit.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("buffer length of {limit} bytes exceeded ({len} bytes pending)")]
    BufferOverflow { len: usize, limit: usize },

    #[error("parse error in the switch parameters: {0}")]
    Parse(#[from] ParseError),

    #[error("can't resolve address of host: {0}")]
    Resolve(String),

    #[error("cannot accept connections from unknown host: {0}")]
    WildcardAccept(String),

    #[error("failed connection to {host}:{port} after {attempts} attempts")]
    ConnectExhausted {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("refused connection from {0}")]
    PeerMismatch(SocketAddr),

    #[error("connection with remote host {0} could not be established")]
    AcceptExhausted(String),

    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("missing data to perform the switch")]
    MissingDecision,

    #[error("no descriptors to switch the communication to")]
    MissingDescriptors,

    #[error("config error: {0}")]
    Config(String),

    #[error("end of input received before switch command")]
    EndOfInput,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchError {
    /// Wrap the last OS error for a named system call.
    pub fn last_os(op: &'static str) -> Self {
        SwitchError::Sys {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    pub fn sys(op: &'static str, source: std::io::Error) -> Self {
        SwitchError::Sys { op, source }
    }
}

pub type SwitchResult<T> = Result<T, SwitchError>;
