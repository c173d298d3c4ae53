//! nx-switch: stand-alone host for the connection switch.
//!
//! Waits for the switch command on standard input and bridges the
//! connection it names to a pair of descriptors, or checks how a command
//! line would be understood.

mod commands;

use clap::{Parser, Subcommand};
use nxswitch::{ClosePolicy, Overrides, SwitchConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// nx-switch: connection-switching proxy
#[derive(Parser, Debug)]
#[command(name = "nx-switch", version, about = "Connection-switching proxy")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.nxswitch/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Which legs a failing descriptor closes (per-leg, both)
    #[arg(long)]
    close_policy: Option<ClosePolicy>,

    /// Send diagnostics to the transport error log after switching
    #[arg(long)]
    redirect_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for the switch command on standard input, then bridge the connection
    Serve {
        /// Descriptor to read channel data from, unless the command names one
        #[arg(long = "in", default_value_t = 0)]
        input: i32,
        /// Descriptor to write channel data to, unless the command names one
        #[arg(long = "out", default_value_t = 1)]
        output: i32,
    },
    /// Parse a switch command line and print the decision as JSON
    Check {
        /// The command line, with or without the switch prefix
        line: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing on stderr; stdout may carry channel data.
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Check { line } => commands::check::run(&line),
        Command::Serve { input, output } => {
            let overrides = Overrides {
                close_policy: cli.close_policy,
                redirect_log: cli.redirect_log,
            };
            match SwitchConfig::load(Some(&PathBuf::from(&cli.config)), &overrides) {
                Ok(config) => {
                    info!(version = env!("CARGO_PKG_VERSION"), "starting nx-switch");
                    commands::serve::run(config, (input, output)).await
                }
                Err(e) => Err(anyhow::Error::new(e).context("failed to load config")),
            }
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("nx-switch: {e:#}");
        std::process::exit(1);
    }
    // The bridge may still be blocked after a shutdown signal.
    std::process::exit(0);
}
