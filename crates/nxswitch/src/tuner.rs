//! Socket options applied to every descriptor that carries switched traffic.
//!
//! Options that a descriptor cannot support (a pipe has no `TCP_NODELAY`, a
//! Unix socket has no IP type-of-service) are reported as
//! [`OptionStatus::Unsupported`] and otherwise ignored.

use crate::sys;
use std::io;
use std::os::fd::RawFd;
use tracing::{debug, error, warn};

const IPTOS_LOWDELAY: libc::c_int = 0x10;

/// Outcome of applying one option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionStatus {
    Applied,
    Unsupported,
    Failed,
}

/// Per-option outcome of [`tune`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneReport {
    pub blocking: OptionStatus,
    pub nodelay: OptionStatus,
    pub lowdelay: OptionStatus,
}

fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EOPNOTSUPP) | Some(libc::ENOPROTOOPT) | Some(libc::ENOTSOCK)
    )
}

fn update_flags(fd: RawFd, blocking: bool) -> io::Result<()> {
    let flags = sys::get_flags(fd)?;
    let flags = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    sys::set_flags(fd, flags)
}

pub fn set_blocking(fd: RawFd) -> OptionStatus {
    match update_flags(fd, true) {
        Ok(()) => {
            debug!(fd, "reset O_NONBLOCK on descriptor");
            OptionStatus::Applied
        }
        Err(e) => {
            error!(fd, error = %e, "failed to reset O_NONBLOCK on descriptor");
            OptionStatus::Failed
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> OptionStatus {
    match update_flags(fd, false) {
        Ok(()) => {
            debug!(fd, "set O_NONBLOCK on descriptor");
            OptionStatus::Applied
        }
        Err(e) => {
            error!(fd, error = %e, "failed to set O_NONBLOCK on descriptor");
            OptionStatus::Failed
        }
    }
}

fn apply_option(
    fd: RawFd,
    name: &'static str,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> OptionStatus {
    match sys::setsockopt_int(fd, level, option, value) {
        Ok(()) => {
            debug!(fd, option = name, "set option on descriptor");
            OptionStatus::Applied
        }
        Err(e) if is_unsupported(&e) => {
            debug!(fd, option = name, "option not supported on descriptor");
            OptionStatus::Unsupported
        }
        Err(e) => {
            warn!(fd, option = name, error = %e, "failed to set option on descriptor");
            OptionStatus::Failed
        }
    }
}

/// Disable send coalescing.
pub fn set_nodelay(fd: RawFd) -> OptionStatus {
    apply_option(fd, "TCP_NODELAY", libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

/// Mark the traffic as low latency.
pub fn set_lowdelay(fd: RawFd) -> OptionStatus {
    apply_option(fd, "IPTOS_LOWDELAY", libc::IPPROTO_IP, libc::IP_TOS, IPTOS_LOWDELAY)
}

/// Not part of [`tune`]; available for hosts that want dead-peer detection.
pub fn set_keepalive(fd: RawFd) -> OptionStatus {
    apply_option(fd, "SO_KEEPALIVE", libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)
}

/// Apply the preferred options to a descriptor. Failures are logged and
/// never abort the switch.
pub fn tune(fd: RawFd, blocking: bool) -> TuneReport {
    let blocking = if blocking {
        set_blocking(fd)
    } else {
        set_nonblocking(fd)
    };
    TuneReport {
        blocking,
        nodelay: set_nodelay(fd),
        lowdelay: set_lowdelay(fd),
    }
}
