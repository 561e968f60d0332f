//! Settings: optional TOML file + CLI overrides.
//!
//! The file lives at `~/.config/nettee/config.toml` unless `--config` names
//! another path. A missing file means defaults. CLI flags always win; boolean
//! flags can only switch a behaviour on.

use crate::output::OutputFormat;
use anyhow::{Context, Result};
use nettee_core::relay::DEFAULT_BUFFER_SIZE;
use nettee_core::{Endpoint, Protocol, RelayConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub output: OutputSection,
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub keep_listening: bool,
    #[serde(default)]
    pub max_connections: usize,
    /// Seconds; `0` or absent disables it.
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            keep_listening: false,
            max_connections: 0,
            idle_timeout: None,
            buffer_size: default_buffer_size(),
        }
    }
}

/// `[output]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputSection {
    #[serde(default)]
    pub append: bool,
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Values taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub append: bool,
    pub keep_listening: bool,
    pub max_connections: Option<usize>,
    pub udp: bool,
    pub idle_timeout: Option<u64>,
    pub buffer_size: Option<usize>,
    pub format: Option<OutputFormat>,
}

/// Resolved settings (file merged with CLI overrides).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub protocol: Protocol,
    pub keep_listening: bool,
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
    pub append: bool,
    pub format: OutputFormat,
}

impl Settings {
    /// Load the config file (if any), then apply CLI overrides.
    pub fn load(config_path: Option<&str>, overrides: &Overrides) -> Result<Self> {
        let path = match config_path {
            Some(p) => Some(expand_tilde(p)),
            None => default_config_path(),
        };

        let file = match path {
            Some(path) if path.exists() => read_config(&path)?,
            Some(path) => {
                debug!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        Ok(Self::merge(file, overrides))
    }

    pub fn merge(file: ConfigFile, overrides: &Overrides) -> Self {
        let protocol = if overrides.udp {
            Protocol::Udp
        } else {
            file.relay.protocol
        };
        let idle_secs = overrides.idle_timeout.or(file.relay.idle_timeout);

        Self {
            protocol,
            keep_listening: overrides.keep_listening || file.relay.keep_listening,
            max_connections: overrides
                .max_connections
                .unwrap_or(file.relay.max_connections),
            idle_timeout: idle_secs.filter(|s| *s > 0).map(Duration::from_secs),
            buffer_size: overrides.buffer_size.unwrap_or(file.relay.buffer_size),
            append: overrides.append || file.output.append,
            format: overrides.format.unwrap_or(file.output.format),
        }
    }

    pub fn relay_config(&self, bind: Endpoint, remote: Endpoint) -> RelayConfig {
        RelayConfig {
            protocol: self.protocol,
            bind,
            remote,
            keep_listening: self.keep_listening,
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout,
            buffer_size: self.buffer_size,
        }
    }
}

fn read_config(path: &Path) -> Result<ConfigFile> {
    info!(path = %path.display(), "loading config file");
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config at {}", path.display()))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("nettee").join("config.toml"))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
