//! The embedded transport library, seen from the switch.
//!
//! Internal connections hand one end of a local socketpair to the library,
//! which then runs its own protocol on it. The library is cooperative: it
//! only makes progress when the host lets it run a step, either merged with
//! the host's own descriptor wait ([`proxy_select`]) or on its own
//! ([`Transport::step`]).

use crate::sys;
use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Upper bound of one cooperative step when the caller gives no timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Side of the connection the library plays. The switch only ever creates
/// server-side connections; the client side is driven by the library itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
}

/// Log files the library may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Errors,
}

/// Identifies one connection created by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub i32);

/// Operations the switch needs from the transport library.
pub trait Transport {
    /// Create a connection on `fd` (or on a descriptor of the library's
    /// choosing when `None`), passing the switch options verbatim. The
    /// library takes ownership of `fd`.
    fn create(
        &mut self,
        fd: Option<OwnedFd>,
        role: Role,
        options: Option<&[u8]>,
    ) -> io::Result<TransportHandle>;

    /// Destroy a connection, blocking until the library has shut it down.
    fn destroy(&mut self, handle: TransportHandle);

    /// Whether `handle` (or any connection, with `None`) is still active.
    fn is_running(&self, handle: Option<TransportHandle>) -> bool;

    /// Add the library's descriptors to `fds` and possibly shorten `timeout`.
    /// Returns `false` when the library has nothing left to run.
    fn prepare(&mut self, fds: &mut Vec<libc::pollfd>, timeout: &mut Duration) -> bool;

    /// Wait on the merged set and run the library's handlers for its ready
    /// descriptors. Returns the number of ready descriptors left for the host.
    fn select_execute(&mut self, fds: &mut Vec<libc::pollfd>, timeout: Duration)
        -> io::Result<usize>;

    /// Run the library alone for at most `timeout`.
    fn step(&mut self, timeout: Duration);

    /// Path of one of the library's log files.
    fn log_file(&self, category: LogCategory) -> Option<PathBuf>;
}

/// Stand-in used when no transport library is linked in.
///
/// Every internal connection request fails; nothing is ever running.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransport;

impl Transport for NoTransport {
    fn create(
        &mut self,
        _fd: Option<OwnedFd>,
        _role: Role,
        _options: Option<&[u8]>,
    ) -> io::Result<TransportHandle> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no transport library is linked in",
        ))
    }

    fn destroy(&mut self, _handle: TransportHandle) {}

    fn is_running(&self, _handle: Option<TransportHandle>) -> bool {
        false
    }

    fn prepare(&mut self, _fds: &mut Vec<libc::pollfd>, _timeout: &mut Duration) -> bool {
        false
    }

    fn select_execute(
        &mut self,
        fds: &mut Vec<libc::pollfd>,
        timeout: Duration,
    ) -> io::Result<usize> {
        sys::poll(fds, Some(timeout))
    }

    fn step(&mut self, _timeout: Duration) {}

    fn log_file(&self, _category: LogCategory) -> Option<PathBuf> {
        None
    }
}

/// Descriptor wait used by the host once the switch may have happened.
///
/// While the transport has a connection running, the host's descriptors are
/// merged with the library's and the library gets to run its handlers;
/// a missing timeout is bounded by [`DEFAULT_STEP_TIMEOUT`] so the library
/// keeps running. When the library reports nothing left to run, returns 0
/// immediately instead of sleeping. Otherwise this is a plain `poll`.
pub fn proxy_select(
    transport: &mut dyn Transport,
    fds: &mut Vec<libc::pollfd>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    if transport.is_running(None) {
        let mut timeout = timeout.unwrap_or(DEFAULT_STEP_TIMEOUT);
        debug!("going to run a new transport loop");
        if transport.prepare(fds, &mut timeout) {
            transport.select_execute(fds, timeout)
        } else {
            Ok(0)
        }
    } else {
        sys::poll(fds, timeout)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::os::fd::{AsRawFd, RawFd};
    use std::rc::Rc;

    /// Observable state of a [`MockTransport`].
    #[derive(Debug, Default)]
    pub struct MockState {
        pub created: Vec<(Option<RawFd>, Role, Option<Vec<u8>>)>,
        /// Descriptors handed over by `create`, kept open like a library would.
        pub held: Vec<OwnedFd>,
        pub destroyed: Vec<TransportHandle>,
        pub steps: usize,
        /// Remaining `is_running` answers that report `true`.
        pub running_for: usize,
        pub prepared: usize,
        pub log_file: Option<PathBuf>,
    }

    /// Scriptable transport for tests; clones share state.
    #[derive(Debug, Default, Clone)]
    pub struct MockTransport(pub Rc<RefCell<MockState>>);

    impl MockTransport {
        pub fn state(&self) -> std::cell::Ref<'_, MockState> {
            self.0.borrow()
        }
    }

    impl Transport for MockTransport {
        fn create(
            &mut self,
            fd: Option<OwnedFd>,
            role: Role,
            options: Option<&[u8]>,
        ) -> io::Result<TransportHandle> {
            let mut state = self.0.borrow_mut();
            let raw = fd.as_ref().map(|fd| fd.as_raw_fd());
            state.created.push((raw, role, options.map(<[u8]>::to_vec)));
            state.held.extend(fd);
            Ok(TransportHandle(raw.unwrap_or(-1)))
        }

        fn destroy(&mut self, handle: TransportHandle) {
            self.0.borrow_mut().destroyed.push(handle);
        }

        fn is_running(&self, _handle: Option<TransportHandle>) -> bool {
            let mut state = self.0.borrow_mut();
            if state.running_for > 0 {
                state.running_for -= 1;
                true
            } else {
                false
            }
        }

        fn prepare(&mut self, _fds: &mut Vec<libc::pollfd>, timeout: &mut Duration) -> bool {
            self.0.borrow_mut().prepared += 1;
            *timeout = (*timeout).min(Duration::from_millis(10));
            true
        }

        fn select_execute(
            &mut self,
            fds: &mut Vec<libc::pollfd>,
            timeout: Duration,
        ) -> io::Result<usize> {
            sys::poll(fds, Some(timeout))
        }

        fn step(&mut self, _timeout: Duration) {
            self.0.borrow_mut().steps += 1;
        }

        fn log_file(&self, category: LogCategory) -> Option<PathBuf> {
            match category {
                LogCategory::Errors => self.0.borrow().log_file.clone(),
            }
        }
    }
}
