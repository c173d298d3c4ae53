//! Establishing the data path a switch decision asks for.
//!
//! An internal decision gets a local socketpair whose far end is handed to
//! the transport library. An external decision gets an outbound TCP
//! connection, retried on failure. A forwarded port gets a listener that
//! accepts exactly one connection from the expected peer.

use crate::resolver::resolve_ipv4;
use crate::sys;
use crate::transport::{Role, Transport, TransportHandle};
use crate::tuner;
use nxswitch_core::{dump, InternalMode, SwitchDecision, SwitchError, SwitchResult};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry policy for outbound connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Total number of connection attempts.
    pub attempts: u32,
    /// Pause between two attempts.
    pub retry_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Wait policy for a forwarded port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptPolicy {
    /// Number of waits before giving up.
    pub attempts: u32,
    /// Length of one wait.
    pub timeout: Duration,
    pub backlog: i32,
}

impl Default for AcceptPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            timeout: Duration::from_secs(20),
            backlog: 4,
        }
    }
}

/// How the switch introduces itself to an external proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub id: String,
    pub version: String,
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            id: "NXSSH".to_string(),
            version: "3.0.0".to_string(),
        }
    }
}

impl AgentIdentity {
    /// The line sent to an external proxy before any other byte.
    pub fn auth_line(&self, cookie: &str) -> String {
        format!(
            "{}-{} cookie={} ",
            self.id,
            self.version,
            cookie.to_uppercase()
        )
    }
}

/// Result of one connection attempt that did not fail fatally.
#[derive(Debug)]
pub enum Attempt {
    Connected(OwnedFd),
    Failed(io::Error),
}

/// Run `connect` until it succeeds or `policy.attempts` are used up.
///
/// Each attempt gets a deadline equal to the number of attempts left, in
/// seconds. `sleep` is called between attempts, never after the last one.
/// Errors returned by `connect` itself are fatal and stop the retries.
pub fn connect_with_retry<C, S>(
    host: &str,
    addr: SocketAddrV4,
    policy: &ConnectPolicy,
    mut connect: C,
    mut sleep: S,
) -> SwitchResult<OwnedFd>
where
    C: FnMut(SocketAddrV4, Duration) -> SwitchResult<Attempt>,
    S: FnMut(Duration),
{
    let mut remaining = policy.attempts;
    while remaining > 0 {
        let deadline = Duration::from_secs(u64::from(remaining));
        match connect(addr, deadline)? {
            Attempt::Connected(fd) => {
                info!(host = %host, %addr, fd = fd.as_raw_fd(), "connected to remote proxy");
                return Ok(fd);
            }
            Attempt::Failed(e) => {
                remaining -= 1;
                warn!(host = %host, %addr, error = %e, remaining, "connection failed");
                if remaining > 0 {
                    sleep(policy.retry_delay);
                }
            }
        }
    }

    error!(host = %host, port = addr.port(), "giving up connecting to remote proxy");
    Err(SwitchError::ConnectExhausted {
        host: host.to_string(),
        port: addr.port(),
        attempts: policy.attempts,
    })
}

/// One real TCP connection attempt.
fn tcp_connect(addr: SocketAddrV4, deadline: Duration) -> SwitchResult<Attempt> {
    let fd = sys::tcp_socket().map_err(|e| SwitchError::sys("socket", e))?;
    sys::set_reuseaddr(fd.as_raw_fd())
        .map_err(|e| SwitchError::sys("setsockopt(SO_REUSEADDR)", e))?;

    debug!(%addr, deadline_secs = deadline.as_secs(), "connecting");
    match sys::connect_with_deadline(fd.as_raw_fd(), addr, deadline) {
        Ok(()) => Ok(Attempt::Connected(fd)),
        Err(e) => Ok(Attempt::Failed(e)),
    }
}

/// Bind a listener on every local address at `port`.
pub fn listen_on(port: u16, backlog: i32) -> SwitchResult<OwnedFd> {
    let listener = sys::tcp_socket().map_err(|e| SwitchError::sys("socket", e))?;
    let fd = listener.as_raw_fd();
    sys::set_reuseaddr(fd).map_err(|e| SwitchError::sys("setsockopt(SO_REUSEADDR)", e))?;
    sys::bind(fd, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .map_err(|e| SwitchError::sys("bind", e))?;
    sys::listen(fd, backlog).map_err(|e| SwitchError::sys("listen", e))?;
    Ok(listener)
}

/// Accept one connection on `listener`, which must come from `expected`.
///
/// A connection from any other address is fatal, as are wait and accept
/// failures. Interrupted waits are not retried.
pub fn accept_peer(
    listener: &OwnedFd,
    expected: Ipv4Addr,
    policy: &AcceptPolicy,
) -> SwitchResult<OwnedFd> {
    let fd = listener.as_raw_fd();
    for attempt in 1..=policy.attempts {
        let mut fds = [sys::pollfd(fd, libc::POLLIN)];
        let ready = sys::poll(&mut fds, Some(policy.timeout))
            .map_err(|e| SwitchError::sys("poll", e))?;
        if ready == 0 {
            debug!(attempt, "no connection yet");
            continue;
        }

        let (conn, peer) = loop {
            match sys::accept(fd) {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SwitchError::sys("accept", e)),
            }
        };
        if *peer.ip() != expected {
            error!(%peer, %expected, "refused connection");
            return Err(SwitchError::PeerMismatch(SocketAddr::V4(peer)));
        }
        info!(%peer, fd = conn.as_raw_fd(), "accepted connection");
        return Ok(conn);
    }

    Err(SwitchError::AcceptExhausted(expected.to_string()))
}

/// Listen on `port` and return the single connection accepted from
/// `accept_host`, tuned for interactive traffic. The listener is closed.
pub fn accept_from(port: u16, accept_host: &str, policy: &AcceptPolicy) -> SwitchResult<OwnedFd> {
    let expected = resolve_ipv4(accept_host)?;
    if expected.is_unspecified() {
        return Err(SwitchError::WildcardAccept(accept_host.to_string()));
    }

    let listener = listen_on(port, policy.backlog)?;
    info!(port, host = %accept_host, "waiting for remote connection");

    let conn = accept_peer(&listener, expected, policy).map_err(|e| match e {
        SwitchError::AcceptExhausted(_) => SwitchError::AcceptExhausted(accept_host.to_string()),
        other => other,
    })?;
    drop(listener);

    tuner::tune(conn.as_raw_fd(), false);
    Ok(conn)
}

/// Opens the proxy end of the data path and remembers what must be torn down.
pub struct ConnectionEstablisher {
    transport: Box<dyn Transport>,
    connect: ConnectPolicy,
    identity: AgentIdentity,
    internal: Option<TransportHandle>,
}

impl ConnectionEstablisher {
    pub fn new(
        transport: Box<dyn Transport>,
        connect: ConnectPolicy,
        identity: AgentIdentity,
    ) -> Self {
        Self {
            transport,
            connect,
            identity,
            internal: None,
        }
    }

    /// Open the proxy descriptor for an external or internal decision.
    pub fn open(&mut self, decision: &SwitchDecision) -> SwitchResult<OwnedFd> {
        match decision {
            SwitchDecision::External { host, port, .. } => self.open_external(host, *port),
            SwitchDecision::Internal { mode, options } => {
                self.open_internal(*mode, options.as_deref())
            }
            _ => Err(SwitchError::MissingDecision),
        }
    }

    fn open_internal(
        &mut self,
        mode: Option<InternalMode>,
        options: Option<&[u8]>,
    ) -> SwitchResult<OwnedFd> {
        let (local, remote) = UnixStream::pair().map_err(|e| SwitchError::sys("socketpair", e))?;
        let local = OwnedFd::from(local);
        let remote = OwnedFd::from(remote);
        debug!(
            local = local.as_raw_fd(),
            remote = remote.as_raw_fd(),
            "created internal socketpair"
        );

        let unencrypted = mode == Some(InternalMode::Unencrypted);
        let handed = if unencrypted {
            drop(remote);
            None
        } else {
            Some(remote)
        };
        if let Some(options) = options {
            dump::dump_bytes("transport options", options);
        }

        let handle = self
            .transport
            .create(handed, Role::Server, options)
            .map_err(|e| SwitchError::Transport(format!("cannot create internal connection: {e}")))?;
        self.internal = Some(handle);
        info!(?handle, unencrypted, "created internal connection");

        if !unencrypted {
            tuner::tune(local.as_raw_fd(), false);
        }
        Ok(local)
    }

    fn open_external(&mut self, host: &str, port: u16) -> SwitchResult<OwnedFd> {
        let ip = resolve_ipv4(host)?;
        let addr = SocketAddrV4::new(ip, port);
        info!(host = %host, %addr, "connecting to remote proxy");

        let fd = connect_with_retry(host, addr, &self.connect, tcp_connect, std::thread::sleep)?;
        tuner::tune(fd.as_raw_fd(), false);
        Ok(fd)
    }

    /// Send the authentication line to an external proxy when a cookie was given.
    pub fn authenticate(&self, fd: RawFd, decision: &SwitchDecision) -> SwitchResult<()> {
        let Some(cookie) = decision.cookie() else {
            return Ok(());
        };
        let line = self.identity.auth_line(cookie);
        dump::dump_bytes("authentication", line.as_bytes());
        sys::write_all(fd, line.as_bytes()).map_err(|e| SwitchError::sys("write", e))?;
        debug!(fd, "sent authentication cookie");
        Ok(())
    }

    /// Destroy the internal connection, if one was created.
    pub fn teardown(&mut self) {
        if let Some(handle) = self.internal.take() {
            debug!(?handle, "destroying internal connection");
            self.transport.destroy(handle);
        }
    }

    /// Whether an internal connection is currently owned.
    #[cfg(test)]
    fn has_internal(&self) -> bool {
        self.internal.is_some()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn refused() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionRefused)
    }

    fn dummy_fd() -> OwnedFd {
        OwnedFd::from(UnixStream::pair().unwrap().0)
    }

    #[test]
    fn three_failures_then_success() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000);
        let mut deadlines = Vec::new();
        let mut sleeps = Vec::new();

        let fd = connect_with_retry(
            "localhost",
            addr,
            &ConnectPolicy::default(),
            |_, deadline| {
                deadlines.push(deadline.as_secs());
                if deadlines.len() < 4 {
                    Ok(Attempt::Failed(refused()))
                } else {
                    Ok(Attempt::Connected(dummy_fd()))
                }
            },
            |delay| sleeps.push(delay),
        );

        assert!(fd.is_ok());
        assert_eq!(deadlines, vec![4, 3, 2, 1]);
        assert_eq!(sleeps, vec![Duration::from_secs(3); 3]);
    }

    #[test]
    fn retries_exhausted() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000);
        let mut attempts = 0;
        let mut sleeps = 0;
        let err = connect_with_retry(
            "localhost",
            addr,
            &ConnectPolicy::default(),
            |_, _| {
                attempts += 1;
                Ok(Attempt::Failed(refused()))
            },
            |_| sleeps += 1,
        )
        .unwrap_err();

        assert_eq!(attempts, 4);
        assert_eq!(sleeps, 3);
        assert!(matches!(
            err,
            SwitchError::ConnectExhausted { port: 4000, attempts: 4, .. }
        ));
    }

    #[test]
    fn fatal_connect_error_stops_retries() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000);
        let mut attempts = 0;
        let err = connect_with_retry(
            "localhost",
            addr,
            &ConnectPolicy::default(),
            |_, _| {
                attempts += 1;
                Err(SwitchError::sys("socket", refused()))
            },
            |_| panic!("no sleep after a fatal error"),
        )
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(matches!(err, SwitchError::Sys { op: "socket", .. }));
    }

    #[test]
    fn auth_line_format() {
        let identity = AgentIdentity::default();
        assert_eq!(identity.auth_line("abc123"), "NXSSH-3.0.0 cookie=ABC123 ");
    }

    #[test]
    fn external_open_and_authenticate() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 23];
            conn.read_exact(&mut buf).unwrap();
            buf
        });

        let decision = SwitchDecision::External {
            host: "127.0.0.1".into(),
            port,
            cookie: Some("abc".into()),
            input: None,
            output: None,
        };
        let mut establisher = ConnectionEstablisher::new(
            Box::new(MockTransport::default()),
            ConnectPolicy::default(),
            AgentIdentity::default(),
        );
        let fd = establisher.open(&decision).unwrap();
        establisher.authenticate(fd.as_raw_fd(), &decision).unwrap();

        assert_eq!(&server.join().unwrap(), b"NXSSH-3.0.0 cookie=ABC ");
        assert!(!establisher.has_internal());
    }

    #[test]
    fn internal_open_hands_far_end_to_transport() {
        let mock = MockTransport::default();
        let mut establisher = ConnectionEstablisher::new(
            Box::new(mock.clone()),
            ConnectPolicy::default(),
            AgentIdentity::default(),
        );
        let decision = SwitchDecision::Internal {
            mode: None,
            options: Some("link=lan".into()),
        };
        let local = establisher.open(&decision).unwrap();

        {
            let state = mock.state();
            assert_eq!(state.created.len(), 1);
            let (fd, role, options) = &state.created[0];
            assert!(fd.is_some());
            assert_eq!(*role, Role::Server);
            assert_eq!(options.as_deref(), Some(&b"link=lan"[..]));
        }
        let flags = sys::get_flags(local.as_raw_fd()).unwrap();
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        establisher.teardown();
        establisher.teardown();
        assert_eq!(mock.state().destroyed.len(), 1);
    }

    #[test]
    fn unencrypted_internal_passes_no_descriptor() {
        let mock = MockTransport::default();
        let mut establisher = ConnectionEstablisher::new(
            Box::new(mock.clone()),
            ConnectPolicy::default(),
            AgentIdentity::default(),
        );
        let decision = SwitchDecision::Internal {
            mode: Some(InternalMode::Unencrypted),
            options: None,
        };
        let local = establisher.open(&decision).unwrap();

        assert_eq!(mock.state().created[0].0, None);
        let flags = sys::get_flags(local.as_raw_fd()).unwrap();
        assert_eq!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn open_rejects_forwarding_decisions() {
        let mut establisher = ConnectionEstablisher::new(
            Box::new(MockTransport::default()),
            ConnectPolicy::default(),
            AgentIdentity::default(),
        );
        let decision = SwitchDecision::ForwardPort {
            port: 1,
            accept_host: "localhost".into(),
        };
        assert!(matches!(
            establisher.open(&decision),
            Err(SwitchError::MissingDecision)
        ));
    }

    fn quick_policy() -> AcceptPolicy {
        AcceptPolicy {
            attempts: 2,
            timeout: Duration::from_millis(20),
            backlog: 4,
        }
    }

    #[test]
    fn accepts_expected_peer() {
        let listener = listen_on(0, 4).unwrap();
        let port = sys::local_addr(listener.as_raw_fd()).unwrap().port();
        let client = thread::spawn(move || TcpStream::connect(("127.0.0.1", port)).unwrap());

        let policy = AcceptPolicy {
            timeout: Duration::from_secs(5),
            ..quick_policy()
        };
        let conn = accept_peer(&listener, Ipv4Addr::LOCALHOST, &policy).unwrap();
        let _client = client.join().unwrap();
        assert!(conn.as_raw_fd() >= 0);
    }

    #[test]
    fn refuses_unexpected_peer() {
        let listener = listen_on(0, 4).unwrap();
        let port = sys::local_addr(listener.as_raw_fd()).unwrap().port();
        let client = thread::spawn(move || TcpStream::connect(("127.0.0.1", port)).unwrap());

        let policy = AcceptPolicy {
            timeout: Duration::from_secs(5),
            ..quick_policy()
        };
        let err = accept_peer(&listener, Ipv4Addr::new(10, 1, 2, 3), &policy).unwrap_err();
        let _client = client.join().unwrap();
        assert!(matches!(err, SwitchError::PeerMismatch(peer) if peer.ip().is_loopback()));
    }

    #[test]
    fn gives_up_without_peer() {
        let listener = listen_on(0, 4).unwrap();
        let err = accept_peer(&listener, Ipv4Addr::LOCALHOST, &quick_policy()).unwrap_err();
        assert!(matches!(err, SwitchError::AcceptExhausted(_)));
    }

    #[test]
    fn wildcard_accept_host_is_fatal() {
        let err = accept_from(0, "0.0.0.0", &quick_policy()).unwrap_err();
        assert!(matches!(err, SwitchError::WildcardAccept(ref h) if h == "0.0.0.0"));
    }
}
