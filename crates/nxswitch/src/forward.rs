//! The blocking bidirectional pump between the proxy and the channel.
//!
//! Two legs, each a read side and a write side. Data read from one leg's
//! input is written to the other leg's output. A read or write failure on
//! any descriptor closes the leg that descriptor belongs to; the loop keeps
//! running until no read side is left.

use crate::sys::{self, SigpipeGuard};
use crate::transport::{Transport, DEFAULT_STEP_TIMEOUT};
use crate::tuner;
use nxswitch_core::dump;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use tracing::{debug, error, info, warn};

/// Size of the single transfer buffer.
pub const FORWARD_BUFFER_SIZE: usize = 64 * 1024;

/// What a failing descriptor takes down with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClosePolicy {
    /// Close only the leg the descriptor belongs to.
    #[default]
    PerLeg,
    /// Close both legs on the first failure.
    Both,
}

impl FromStr for ClosePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-leg" => Ok(ClosePolicy::PerLeg),
            "both" => Ok(ClosePolicy::Both),
            other => Err(format!("unknown close policy: {other}")),
        }
    }
}

impl fmt::Display for ClosePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosePolicy::PerLeg => f.write_str("per-leg"),
            ClosePolicy::Both => f.write_str("both"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Proxy,
    Channel,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Proxy => Side::Channel,
            Side::Channel => Side::Proxy,
        }
    }
}

/// The four roles a forwarded descriptor can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ProxyIn,
    ProxyOut,
    ChannelIn,
    ChannelOut,
}

impl Endpoint {
    fn side(self) -> Side {
        match self {
            Endpoint::ProxyIn | Endpoint::ProxyOut => Side::Proxy,
            Endpoint::ChannelIn | Endpoint::ChannelOut => Side::Channel,
        }
    }
}

#[derive(Debug)]
struct Leg {
    name: &'static str,
    input: Option<OwnedFd>,
    output: Option<OwnedFd>,
}

impl Leg {
    fn new(name: &'static str, input: OwnedFd, output: OwnedFd) -> Self {
        Self {
            name,
            input: Some(input),
            output: Some(output),
        }
    }

    fn close(&mut self) {
        let input = self.input.take();
        let output = self.output.take();
        debug!(
            leg = self.name,
            input = input.as_ref().map(AsRawFd::as_raw_fd),
            output = output.as_ref().map(AsRawFd::as_raw_fd),
            "closing leg"
        );
    }
}

/// Why the loop stopped.
#[derive(Debug)]
pub enum LoopExit {
    /// Every read side was closed.
    Closed,
    /// Waiting for readiness failed.
    WaitFailed(io::Error),
}

/// Summary of a finished forwarding session.
#[derive(Debug)]
pub struct ForwardReport {
    pub exit: LoopExit,
    pub channel_to_proxy: u64,
    pub proxy_to_channel: u64,
}

/// One proxy/channel pairing driven by [`ForwardingSession::run`].
#[derive(Debug)]
pub struct ForwardingSession {
    proxy: Leg,
    channel: Leg,
    policy: ClosePolicy,
}

impl ForwardingSession {
    /// All four descriptors must be distinct; each is closed exactly once.
    pub fn new(
        proxy_in: OwnedFd,
        proxy_out: OwnedFd,
        channel_in: OwnedFd,
        channel_out: OwnedFd,
        policy: ClosePolicy,
    ) -> Self {
        Self {
            proxy: Leg::new("proxy", proxy_in, proxy_out),
            channel: Leg::new("channel", channel_in, channel_out),
            policy,
        }
    }

    fn leg(&self, side: Side) -> &Leg {
        match side {
            Side::Proxy => &self.proxy,
            Side::Channel => &self.channel,
        }
    }

    fn leg_mut(&mut self, side: Side) -> &mut Leg {
        match side {
            Side::Proxy => &mut self.proxy,
            Side::Channel => &mut self.channel,
        }
    }

    fn raw(fd: &Option<OwnedFd>) -> Option<RawFd> {
        fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn any_open(&self) -> bool {
        self.proxy.input.is_some() || self.channel.input.is_some()
    }

    /// Classify `fd` among the four roles.
    fn endpoint_of(&self, fd: RawFd) -> Option<Endpoint> {
        let candidates = [
            (Self::raw(&self.proxy.input), Endpoint::ProxyIn),
            (Self::raw(&self.proxy.output), Endpoint::ProxyOut),
            (Self::raw(&self.channel.input), Endpoint::ChannelIn),
            (Self::raw(&self.channel.output), Endpoint::ChannelOut),
        ];
        candidates
            .into_iter()
            .find_map(|(raw, endpoint)| (raw == Some(fd)).then_some(endpoint))
    }

    fn fail(&mut self, fd: RawFd) {
        let Some(endpoint) = self.endpoint_of(fd) else {
            warn!(fd, "failing descriptor is not part of the session");
            return;
        };
        info!(fd, ?endpoint, policy = %self.policy, "closing after failure");
        match self.policy {
            ClosePolicy::PerLeg => self.leg_mut(endpoint.side()).close(),
            ClosePolicy::Both => {
                self.proxy.close();
                self.channel.close();
            }
        }
    }

    /// Move one chunk from `from`'s input to the other leg's output.
    fn transfer(&mut self, from: Side, buffer: &mut [u8]) -> u64 {
        let Some(src) = Self::raw(&self.leg(from).input) else {
            return 0;
        };

        let len = match read_retrying(src, buffer) {
            Ok(0) => {
                debug!(fd = src, "end of file");
                self.fail(src);
                return 0;
            }
            Ok(len) => len,
            Err(e) => {
                error!(fd = src, error = %e, "read failed");
                self.fail(src);
                return 0;
            }
        };
        dump::dump_bytes(self.leg(from).name, &buffer[..len]);

        let to = from.other();
        let Some(dst) = Self::raw(&self.leg(to).output) else {
            warn!(fd = src, len, leg = self.leg(to).name, "destination closed, discarding data");
            return 0;
        };
        match write_fully(dst, &buffer[..len]) {
            Ok(()) => {
                debug!(from = src, to = dst, len, "forwarded");
                len as u64
            }
            Err(e) => {
                error!(fd = dst, error = %e, "write failed");
                self.fail(dst);
                0
            }
        }
    }

    /// Pump data until every read side is closed or waiting fails.
    pub fn run(mut self) -> ForwardReport {
        let _sigpipe = SigpipeGuard::ignore();
        for fd in [
            &self.proxy.input,
            &self.proxy.output,
            &self.channel.input,
            &self.channel.output,
        ]
        .into_iter()
        .filter_map(Self::raw)
        {
            tuner::tune(fd, true);
        }

        let mut buffer = vec![0u8; FORWARD_BUFFER_SIZE];
        let mut channel_to_proxy = 0;
        let mut proxy_to_channel = 0;

        let exit = loop {
            if !self.any_open() {
                break LoopExit::Closed;
            }

            let channel_in = Self::raw(&self.channel.input);
            let proxy_in = Self::raw(&self.proxy.input);
            let mut fds: Vec<libc::pollfd> = [channel_in, proxy_in]
                .into_iter()
                .flatten()
                .map(|fd| sys::pollfd(fd, libc::POLLIN))
                .collect();

            match sys::poll(&mut fds, None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "waiting for descriptors failed");
                    break LoopExit::WaitFailed(e);
                }
            }

            let ready = |fd: Option<RawFd>| {
                fds.iter()
                    .any(|p| Some(p.fd) == fd && p.revents != 0)
            };
            let channel_ready = ready(channel_in);
            let proxy_ready = ready(proxy_in);

            if channel_ready {
                channel_to_proxy += self.transfer(Side::Channel, &mut buffer);
            }
            if proxy_ready && Self::raw(&self.proxy.input) == proxy_in {
                proxy_to_channel += self.transfer(Side::Proxy, &mut buffer);
            }
        };

        self.proxy.close();
        self.channel.close();
        info!(channel_to_proxy, proxy_to_channel, "forwarding finished");
        ForwardReport {
            exit,
            channel_to_proxy,
            proxy_to_channel,
        }
    }
}

fn read_retrying(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
        match sys::read(fd, buffer) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Write all of `data`, waiting for writability when the descriptor is full.
fn write_fully(fd: RawFd, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match sys::write(fd, data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let mut fds = [sys::pollfd(fd, libc::POLLOUT)];
                match sys::poll(&mut fds, None) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Client half of an unencrypted internal connection.
///
/// The proxy end is not used: the transport library owns the connection
/// and runs it until it has nothing left to do.
pub fn run_client_side_loop(proxy_fd: OwnedFd, transport: &mut dyn Transport) -> usize {
    debug!(fd = proxy_fd.as_raw_fd(), "closing unused proxy descriptor");
    drop(proxy_fd);

    let mut steps = 0;
    while transport.is_running(None) {
        transport.step(DEFAULT_STEP_TIMEOUT);
        steps += 1;
    }
    info!(steps, "transport finished");
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::os::unix::net::UnixStream;
    use std::thread;

    struct Harness {
        peer: UnixStream,
        channel_writer: OwnedFd,
        channel_reader: OwnedFd,
        session: ForwardingSession,
    }

    fn harness(policy: ClosePolicy) -> Harness {
        let (ours, peer) = UnixStream::pair().unwrap();
        let ours = OwnedFd::from(ours);
        let proxy_in = sys::dup(ours.as_raw_fd()).unwrap();
        let (channel_in, channel_writer) = sys::pipe().unwrap();
        let (channel_reader, channel_out) = sys::pipe().unwrap();
        Harness {
            peer,
            channel_writer,
            channel_reader,
            session: ForwardingSession::new(proxy_in, ours, channel_in, channel_out, policy),
        }
    }

    fn read_some(fd: RawFd) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let n = sys::read(fd, &mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn round_trip_in_both_directions() {
        let Harness {
            mut peer,
            channel_writer,
            channel_reader,
            session,
        } = harness(ClosePolicy::PerLeg);
        let pump = thread::spawn(move || session.run());

        sys::write_all(channel_writer.as_raw_fd(), b"hello").unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").unwrap();
        assert_eq!(read_some(channel_reader.as_raw_fd()), b"world");

        drop(channel_writer);
        drop(peer);
        let report = pump.join().unwrap();
        assert!(matches!(report.exit, LoopExit::Closed));
        assert_eq!(report.channel_to_proxy, 5);
        assert_eq!(report.proxy_to_channel, 5);
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
    }

    #[test]
    fn large_transfers_arrive_whole_and_in_order() {
        let Harness {
            mut peer,
            channel_writer,
            channel_reader,
            session,
        } = harness(ClosePolicy::PerLeg);
        let pump = thread::spawn(move || session.run());
        let len = 5 * FORWARD_BUFFER_SIZE;

        let upstream = pattern(len, 0x00);
        let sent = upstream.clone();
        let writer = thread::spawn(move || {
            sys::write_all(channel_writer.as_raw_fd(), &sent).unwrap();
            channel_writer
        });
        let mut received = vec![0u8; len];
        peer.read_exact(&mut received).unwrap();
        assert!(received == upstream);
        let channel_writer = writer.join().unwrap();

        let downstream = pattern(len, 0x5a);
        let sent = downstream.clone();
        let mut peer_writer = peer.try_clone().unwrap();
        let writer = thread::spawn(move || peer_writer.write_all(&sent).unwrap());
        let mut channel_reader = std::fs::File::from(channel_reader);
        let mut received = vec![0u8; len];
        channel_reader.read_exact(&mut received).unwrap();
        assert!(received == downstream);
        writer.join().unwrap();

        drop(channel_writer);
        drop(peer);
        let report = pump.join().unwrap();
        assert!(matches!(report.exit, LoopExit::Closed));
        assert_eq!(report.channel_to_proxy, len as u64);
        assert_eq!(report.proxy_to_channel, len as u64);
    }

    #[test]
    fn proxy_failure_closes_only_the_proxy_leg() {
        let Harness {
            mut peer,
            channel_writer,
            channel_reader,
            session,
        } = harness(ClosePolicy::PerLeg);
        let pump = thread::spawn(move || session.run());

        peer.shutdown(Shutdown::Write).unwrap();
        // Both proxy descriptors are closed, so the peer sees end of file.
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        // The channel leg is still open.
        tuner::set_nonblocking(channel_reader.as_raw_fd());
        let mut buf = [0u8; 8];
        let err = sys::read(channel_reader.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Channel data now has nowhere to go and is dropped.
        sys::write_all(channel_writer.as_raw_fd(), b"late").unwrap();
        drop(channel_writer);

        let report = pump.join().unwrap();
        assert!(matches!(report.exit, LoopExit::Closed));
        assert_eq!(report.channel_to_proxy, 0);
        assert_eq!(sys::read(channel_reader.as_raw_fd(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn both_policy_closes_everything_on_first_failure() {
        let Harness {
            mut peer,
            channel_writer,
            channel_reader,
            session,
        } = harness(ClosePolicy::Both);
        let pump = thread::spawn(move || session.run());

        drop(channel_writer);
        let report = pump.join().unwrap();
        assert!(matches!(report.exit, LoopExit::Closed));

        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        let mut buf = [0u8; 8];
        assert_eq!(sys::read(channel_reader.as_raw_fd(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn close_policy_parses() {
        assert_eq!("per-leg".parse::<ClosePolicy>().unwrap(), ClosePolicy::PerLeg);
        assert_eq!("both".parse::<ClosePolicy>().unwrap(), ClosePolicy::Both);
        assert!("all".parse::<ClosePolicy>().is_err());
        assert_eq!(ClosePolicy::default(), ClosePolicy::PerLeg);
    }

    #[test]
    fn client_loop_steps_until_transport_stops() {
        let mock = MockTransport::default();
        mock.0.borrow_mut().running_for = 3;
        let mut transport = mock.clone();
        let (fd, _other) = UnixStream::pair().unwrap();

        let steps = run_client_side_loop(OwnedFd::from(fd), &mut transport);
        assert_eq!(steps, 3);
        assert_eq!(mock.state().steps, 3);
    }
}
