//! Host name to IPv4 address resolution.
//!
//! Uses the system resolver through [`ToSocketAddrs`] and keeps the first
//! IPv4 answer. Numeric dotted-quad addresses are accepted directly when the
//! resolver has nothing to say about them.

use nxswitch_core::{SwitchError, SwitchResult};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use tracing::{debug, warn};

/// Resolve `host` to the first IPv4 address it maps to.
///
/// # Errors
///
/// Returns [`SwitchError::Resolve`] when the lookup yields no IPv4 address
/// and `host` is not a numeric IPv4 address either.
pub fn resolve_ipv4(host: &str) -> SwitchResult<Ipv4Addr> {
    match (host, 0).to_socket_addrs() {
        Ok(addrs) => {
            let first = addrs.into_iter().find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            });
            if let Some(ip) = first {
                debug!(host = %host, ip = %ip, "resolved");
                return Ok(ip);
            }
            debug!(host = %host, "no IPv4 records found");
        }
        Err(e) => {
            warn!(host = %host, error = %e, "name lookup failed, trying numeric address");
        }
    }

    host.parse::<Ipv4Addr>()
        .map_err(|_| SwitchError::Resolve(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_numeric_address() {
        assert_eq!(
            resolve_ipv4("10.0.0.5").unwrap(),
            Ipv4Addr::new(10, 0, 0, 5)
        );
    }

    #[test]
    fn resolves_localhost() {
        assert!(resolve_ipv4("localhost").unwrap().is_loopback());
    }

    #[test]
    fn wildcard_resolves_to_unspecified() {
        assert!(resolve_ipv4("0.0.0.0").unwrap().is_unspecified());
    }

    #[test]
    fn unknown_host_is_an_error() {
        let err = resolve_ipv4("no-such-host.invalid").unwrap_err();
        assert!(matches!(err, SwitchError::Resolve(ref h) if h == "no-such-host.invalid"));
    }
}
