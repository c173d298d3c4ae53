//! `nx-switch check`: show how a switch command line is understood.

use anyhow::{Context, Result};
use nxswitch_core::{parse_switch_command, SWITCH_COMMAND};

/// Parse `line` and print the resulting decision as pretty JSON.
pub fn run(line: &str) -> Result<()> {
    let line = line.trim_end_matches(['\n', '\r']);
    let command = if line.starts_with(SWITCH_COMMAND) {
        line.to_string()
    } else {
        format!("{SWITCH_COMMAND}{line}")
    };

    let decision = parse_switch_command(command.as_bytes())
        .with_context(|| format!("cannot parse switch command {line:?}"))?;
    let json = serde_json::to_string_pretty(&decision).context("failed to encode decision")?;
    println!("{json}");
    Ok(())
}
