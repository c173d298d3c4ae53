//! Thin wrappers over the descriptor-level system calls used by the switch.
//!
//! Everything here returns `io::Result` with the OS error preserved so that
//! callers can tell `EINTR`/`EAGAIN` apart from hard failures.

use std::io::{self, Read};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn to_sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

fn from_sockaddr(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    )
}

/// Create an IPv4 stream socket.
pub fn tcp_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the returned descriptor is owned below.
    let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })?;
    // SAFETY: fd was just returned by socket(2) and is not owned elsewhere.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Set an integer socket option.
pub fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: value lives for the duration of the call and its size is passed.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(drop)
}

fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value/len are valid for writes of the declared size.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    if value == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(value))
    }
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

/// Read the file status flags.
pub fn get_flags(fd: RawFd) -> io::Result<libc::c_int> {
    // SAFETY: F_GETFL takes no pointer arguments.
    cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })
}

pub fn set_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    // SAFETY: F_SETFL takes an integer argument.
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(drop)
}

/// Connect `fd` to `addr`, giving up with `TimedOut` after `deadline`.
///
/// The descriptor's blocking mode is restored before returning.
pub fn connect_with_deadline(fd: RawFd, addr: SocketAddrV4, deadline: Duration) -> io::Result<()> {
    let flags = get_flags(fd)?;
    set_flags(fd, flags | libc::O_NONBLOCK)?;

    let result = connect_nonblocking(fd, addr, deadline);

    set_flags(fd, flags)?;
    result
}

fn connect_nonblocking(fd: RawFd, addr: SocketAddrV4, deadline: Duration) -> io::Result<()> {
    let sin = to_sockaddr(addr);
    // SAFETY: sin is a valid sockaddr_in and its size is passed.
    let ret = unsafe {
        libc::connect(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EINTR) => {}
        _ => return Err(err),
    }

    let mut fds = [pollfd(fd, libc::POLLOUT)];
    if poll(&mut fds, Some(deadline))? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        ));
    }
    take_socket_error(fd)
}

pub fn bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sin = to_sockaddr(addr);
    // SAFETY: sin is a valid sockaddr_in and its size is passed.
    cvt(unsafe {
        libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
    .map(drop)
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    // SAFETY: plain listen(2) call.
    cvt(unsafe { libc::listen(fd, backlog) }).map(drop)
}

/// Accept one pending connection and report the peer address.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddrV4)> {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // SAFETY: sin/len are valid for writes of the declared size.
    let new_fd = cvt(unsafe {
        libc::accept(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    // SAFETY: new_fd was just returned by accept(2) and is not owned elsewhere.
    let owned = unsafe { OwnedFd::from_raw_fd(new_fd) };
    Ok((owned, from_sockaddr(&sin)))
}

/// The local address a socket is bound to.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // SAFETY: sin/len are valid for writes of the declared size.
    cvt(unsafe {
        libc::getsockname(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    Ok(from_sockaddr(&sin))
}

/// A poll entry watching `fd` for `events`.
pub fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Wait for readiness. `None` blocks indefinitely.
pub fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };
    // SAFETY: fds is a valid, exclusively borrowed slice of pollfd.
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    cvt(ret).map(|n| n as usize)
}

/// Make `dst` refer to the same open file as `src`.
pub fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
    if src == dst {
        return Ok(());
    }
    loop {
        // SAFETY: dup2 only manipulates the descriptor table.
        match cvt(unsafe { libc::dup2(src, dst) }) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Duplicate a raw descriptor into a new owned one.
pub fn dup(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor owned below.
    let new_fd = cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })?;
    // SAFETY: new_fd was just created and is not owned elsewhere.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for writes of buf.len() bytes.
    cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for reads of buf.len() bytes.
    cvt_size(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
}

/// Write the whole buffer, retrying on interruption.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Unbuffered reader over a descriptor the caller keeps ownership of.
///
/// Used for standard input so that no byte past the switch command is
/// swallowed by a userspace buffer.
#[derive(Debug, Clone, Copy)]
pub struct FdReader(pub RawFd);

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.0, buf)
    }
}

impl AsRawFd for FdReader {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Ignores `SIGPIPE` while alive and restores the previous disposition on drop.
pub struct SigpipeGuard {
    previous: libc::sighandler_t,
}

impl SigpipeGuard {
    pub fn ignore() -> Self {
        // SAFETY: installing SIG_IGN is async-signal-safe and has no handler code.
        let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        Self { previous }
    }
}

impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        if self.previous != libc::SIG_ERR {
            // SAFETY: restores the disposition that was installed before.
            unsafe { libc::signal(libc::SIGPIPE, self.previous) };
        }
    }
}

/// Create an anonymous pipe, returning `(read, write)`.
#[cfg(test)]
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe(2) writes.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: both descriptors were just created and are not owned elsewhere.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
