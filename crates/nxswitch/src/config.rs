//! Switch configuration: TOML file + CLI overrides.

use crate::establish::{AcceptPolicy, AgentIdentity, ConnectPolicy};
use crate::forward::ClosePolicy;
use nxswitch_core::{SwitchError, SwitchResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub switch: SwitchSection,
    #[serde(default)]
    pub connect: ConnectSection,
    #[serde(default)]
    pub accept: AcceptSection,
}

/// `[switch]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchSection {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_advertise_version")]
    pub advertise_version: String,
    #[serde(default)]
    pub redirect_log: bool,
    #[serde(default)]
    pub close_policy: ClosePolicy,
}

impl Default for SwitchSection {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            advertise_version: default_advertise_version(),
            redirect_log: false,
            close_policy: ClosePolicy::default(),
        }
    }
}

/// `[connect]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for ConnectSection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// `[accept]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AcceptSection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_accept_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for AcceptSection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            timeout_secs: default_accept_timeout(),
            backlog: default_backlog(),
        }
    }
}

fn default_agent_id() -> String {
    "NXSSH".to_string()
}
fn default_advertise_version() -> String {
    "3.0.0".to_string()
}
fn default_attempts() -> u32 {
    4
}
fn default_retry_delay() -> u64 {
    3
}
fn default_accept_timeout() -> u64 {
    20
}
fn default_backlog() -> i32 {
    4
}

/// Values given on the command line, which win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub close_policy: Option<ClosePolicy>,
    pub redirect_log: bool,
}

/// Resolved switch configuration.
#[derive(Debug, Clone, Default)]
pub struct SwitchConfig {
    pub identity: AgentIdentity,
    pub connect: ConnectPolicy,
    pub accept: AcceptPolicy,
    pub close_policy: ClosePolicy,
    /// Send diagnostics to the transport's error log once switched.
    pub redirect_log: bool,
}

impl SwitchConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; an unreadable or malformed one is an error.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> SwitchResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| SwitchError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        if file_config.connect.attempts == 0 || file_config.accept.attempts == 0 {
            return Err(SwitchError::Config("attempts must be at least 1".into()));
        }

        Ok(Self {
            identity: AgentIdentity {
                id: file_config.switch.agent_id,
                version: file_config.switch.advertise_version,
            },
            connect: ConnectPolicy {
                attempts: file_config.connect.attempts,
                retry_delay: Duration::from_secs(file_config.connect.retry_delay_secs),
            },
            accept: AcceptPolicy {
                attempts: file_config.accept.attempts,
                timeout: Duration::from_secs(file_config.accept.timeout_secs),
                backlog: file_config.accept.backlog,
            },
            close_policy: overrides
                .close_policy
                .unwrap_or(file_config.switch.close_policy),
            redirect_log: overrides.redirect_log || file_config.switch.redirect_log,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
