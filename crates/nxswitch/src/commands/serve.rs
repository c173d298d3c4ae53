//! `nx-switch serve`: server side of the switch on the process's own descriptors.

use anyhow::{Context, Result};
use nxswitch::sys::FdReader;
use nxswitch::{check_standard_input, DescriptorSwitcher, LoopExit, NoTransport, SwitchConfig};
use nxswitch_core::InputBuffer;
use std::os::fd::RawFd;
use tracing::info;

/// Run the switch until the bridge ends or a shutdown signal arrives.
pub async fn run(config: SwitchConfig, fallback: (RawFd, RawFd)) -> Result<()> {
    let bridge = tokio::task::spawn_blocking(move || serve_blocking(config, fallback));

    tokio::select! {
        joined = bridge => joined.context("switch task failed")?,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            Ok(())
        }
    }
}

fn serve_blocking(config: SwitchConfig, fallback: (RawFd, RawFd)) -> Result<()> {
    let mut reader = FdReader(libc::STDIN_FILENO);
    let mut scanner = InputBuffer::new();
    let decision = check_standard_input(&mut reader, &mut scanner)
        .context("waiting for the switch command")?;
    info!(%decision, "switch command received");

    let mut switcher = DescriptorSwitcher::new(decision, Box::new(NoTransport), config);
    let report = switcher
        .server_side(Some(fallback))
        .context("switching connection")?;
    info!(
        channel_to_proxy = report.channel_to_proxy,
        proxy_to_channel = report.proxy_to_channel,
        "switched connection closed"
    );

    match report.exit {
        LoopExit::Closed => Ok(()),
        LoopExit::WaitFailed(e) => Err(e).context("forwarding loop failed"),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
