//! Applying a switch decision to the channel or to the host's descriptors.
//!
//! On the client side the proxy descriptor simply replaces the channel's
//! descriptors. On the server side the proxy is bridged to the channel by
//! the forwarding loop. The forwarding decisions replace the channel's
//! descriptors with pre-existing ones or with an accepted TCP connection.

use crate::channel::Channel;
use crate::config::SwitchConfig;
use crate::establish::{accept_from, ConnectionEstablisher};
use crate::forward::{run_client_side_loop, ForwardReport, ForwardingSession};
use crate::sys;
use crate::transport::{LogCategory, Transport};
use crate::tuner;
use nxswitch_core::{SwitchDecision, SwitchError, SwitchResult};
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::{debug, info, warn};

pub struct DescriptorSwitcher {
    decision: SwitchDecision,
    establisher: ConnectionEstablisher,
    config: SwitchConfig,
}

impl DescriptorSwitcher {
    pub fn new(decision: SwitchDecision, transport: Box<dyn Transport>, config: SwitchConfig) -> Self {
        let establisher =
            ConnectionEstablisher::new(transport, config.connect.clone(), config.identity.clone());
        Self {
            decision,
            establisher,
            config,
        }
    }

    /// Open the proxy connection for the decision and authenticate on it.
    pub fn open_proxy_connection(&mut self) -> SwitchResult<OwnedFd> {
        let fd = self.establisher.open(&self.decision)?;
        self.establisher.authenticate(fd.as_raw_fd(), &self.decision)?;
        Ok(fd)
    }

    /// Hand the proxy descriptor to the channel.
    ///
    /// For an unencrypted internal connection the transport library runs the
    /// session itself and the process exits with status 0 once it is done;
    /// this call does not return in that case.
    pub fn client_side(&mut self, channel: &mut Channel, proxy_fd: OwnedFd) -> SwitchResult<()> {
        if self.decision.is_unencrypted() {
            info!("running unencrypted client loop");
            run_client_side_loop(proxy_fd, self.establisher.transport_mut());
            info!("unencrypted session finished, exiting");
            std::process::exit(0);
        }

        let proxy = proxy_fd.as_raw_fd();
        for target in [channel.read_fd, channel.write_fd] {
            sys::dup2(proxy, target).map_err(|e| SwitchError::sys("dup2", e))?;
        }
        debug!(
            proxy,
            read_fd = channel.read_fd,
            write_fd = channel.write_fd,
            "switched channel descriptors"
        );
        drop(proxy_fd);

        tuner::tune(channel.read_fd, false);
        tuner::tune(channel.write_fd, false);

        if self.config.redirect_log {
            redirect_log_output(self.establisher.transport());
        }
        Ok(())
    }

    /// Bridge the proxy connection to the `in`/`out` descriptors until both
    /// sides are done.
    ///
    /// Descriptors named by the decision win over `fallback`. Both become
    /// owned by the forwarding loop and are closed when it ends.
    pub fn server_side(&mut self, fallback: Option<(RawFd, RawFd)>) -> SwitchResult<ForwardReport> {
        let (input, output) = self
            .decision
            .descriptors()
            .or(fallback)
            .ok_or(SwitchError::MissingDescriptors)?;

        let proxy_out = self.open_proxy_connection()?;
        let (channel_in, channel_out) = match adopt_pair(input, output) {
            Ok(pair) => pair,
            Err(e) => {
                self.establisher.teardown();
                return Err(e);
            }
        };
        let proxy_in = sys::dup(proxy_out.as_raw_fd()).map_err(|e| SwitchError::sys("dup", e))?;
        info!(
            proxy = proxy_out.as_raw_fd(),
            input, output, "starting forwarding loop"
        );

        let report = ForwardingSession::new(
            proxy_in,
            proxy_out,
            channel_in,
            channel_out,
            self.config.close_policy,
        )
        .run();
        self.establisher.teardown();
        Ok(report)
    }

    /// Replace the channel's descriptors with the decision's `in`/`out`.
    pub fn forward_descriptors(&self, channel: &mut Channel) -> SwitchResult<()> {
        let SwitchDecision::ForwardDescriptors { input, output } = self.decision else {
            return Err(SwitchError::MissingDecision);
        };
        sys::dup2(input, channel.read_fd).map_err(|e| SwitchError::sys("dup2", e))?;
        sys::dup2(output, channel.write_fd).map_err(|e| SwitchError::sys("dup2", e))?;
        info!(input, output, "forwarded channel to descriptors");
        Ok(())
    }

    /// Replace the channel's descriptors with a connection accepted on the
    /// decision's port.
    pub fn forward_port(&self, channel: &mut Channel) -> SwitchResult<()> {
        let SwitchDecision::ForwardPort { port, accept_host } = &self.decision else {
            return Err(SwitchError::MissingDecision);
        };
        let conn = accept_from(*port, accept_host, &self.config.accept)?;
        for target in [channel.read_fd, channel.write_fd] {
            sys::dup2(conn.as_raw_fd(), target).map_err(|e| SwitchError::sys("dup2", e))?;
        }
        info!(port, host = %accept_host, "forwarded channel to accepted connection");
        Ok(())
    }

    /// Destroy the internal transport connection, if any.
    pub fn teardown(&mut self) {
        self.establisher.teardown();
    }
}

/// Adopt the `in`/`out` descriptors, duplicating when both name the same one.
fn adopt_pair(input: RawFd, output: RawFd) -> SwitchResult<(OwnedFd, OwnedFd)> {
    let channel_in = adopt_fd(input)?;
    let channel_out = if output == input {
        sys::dup(input).map_err(|e| SwitchError::sys("dup", e))?
    } else {
        adopt_fd(output)?
    };
    Ok((channel_in, channel_out))
}

/// Take ownership of a descriptor handed over by number.
fn adopt_fd(fd: RawFd) -> SwitchResult<OwnedFd> {
    sys::get_flags(fd).map_err(|e| SwitchError::sys("fcntl", e))?;
    // SAFETY: the descriptor is open (checked above) and its number was given
    // to the switch, which becomes its only user for the rest of the process.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Send standard error to the transport's error log.
///
/// Best effort: returns whether the redirection took place.
pub fn redirect_log_output(transport: &dyn Transport) -> bool {
    redirect_log_to(transport, libc::STDERR_FILENO)
}

fn redirect_log_to(transport: &dyn Transport, target: RawFd) -> bool {
    let Some(path) = transport.log_file(LogCategory::Errors) else {
        debug!("transport has no error log");
        return false;
    };
    let file = match OpenOptions::new().append(true).create(true).open(&path) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open transport error log");
            return false;
        }
    };
    match sys::dup2(file.as_raw_fd(), target) {
        Ok(()) => {
            info!(path = %path.display(), "redirected diagnostics");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot redirect diagnostics");
            false
        }
    }
}
