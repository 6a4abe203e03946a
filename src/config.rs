//! Command line and config file handling

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunnelgate_relay::RelayConfig;

/// Reverse tunnel relay: pairs one agent with one user and forwards bytes
#[derive(Parser, Debug)]
#[command(name = "tunnelgate")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
tunnelgate exposes a service that sits behind NAT. The agent next to the
service dials the control port and keeps the link alive with "pi" heartbeats.
While an agent is connected, the first user to connect to the data port is
paired with it and bytes are relayed both ways until either side leaves.

EXAMPLES:
  # Agents on 3333, users on 5200 (the defaults)
  tunnelgate

  # Custom ports
  tunnelgate -r 7000 -l 8000

  # Settings from a file, log level overridden
  tunnelgate --config relay.yaml --log-level debug

ENVIRONMENT VARIABLES:
  TUNNELGATE_CONTROL_PORT  Port agents dial in on
  TUNNELGATE_DATA_PORT     Port users dial in on
  TUNNELGATE_BIND          Address both listeners bind to
"#)]
pub struct Cli {
    /// Port agents dial in on [default: 3333]
    #[arg(
        short = 'r',
        long,
        env = "TUNNELGATE_CONTROL_PORT",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub control_port: Option<u16>,

    /// Port users dial in on [default: 5200]
    #[arg(
        short = 'l',
        long,
        env = "TUNNELGATE_DATA_PORT",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub data_port: Option<u16>,

    /// Address both listeners bind to [default: 0.0.0.0]
    #[arg(long, env = "TUNNELGATE_BIND")]
    pub bind: Option<IpAddr>,

    /// Seconds without traffic or heartbeat before the agent link is dropped [default: 60]
    #[arg(long, value_name = "SECONDS")]
    pub control_timeout: Option<u64>,

    /// Seconds without traffic before the user link is dropped [default: 200]
    #[arg(long, value_name = "SECONDS")]
    pub data_timeout: Option<u64>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<IpAddr>,

    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_timeout: Option<u64>,

    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_timeout: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Effective settings: flags over file over defaults.
#[derive(Debug)]
pub struct Settings {
    pub relay: RelayConfig,
    pub log_level: String,
}

impl Settings {
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(cli, file)
    }

    fn merge(cli: &Cli, file: ConfigFile) -> Result<Self> {
        let mut relay = RelayConfig::default();

        if let Some(port) = cli.control_port.or(file.control_port) {
            relay.control_port = port;
        }
        if let Some(port) = cli.data_port.or(file.data_port) {
            relay.data_port = port;
        }
        if let Some(bind) = cli.bind.or(file.bind) {
            relay.bind_ip = bind;
        }
        if let Some(secs) = cli.control_timeout.or(file.control_timeout) {
            relay.control_read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.data_timeout.or(file.data_timeout) {
            relay.data_read_timeout = Duration::from_secs(secs);
        }

        if relay.control_port == 0 || relay.data_port == 0 {
            anyhow::bail!("Ports must be between 1 and 65535");
        }
        relay.validate().context("Invalid relay configuration")?;

        let log_level = cli
            .log_level
            .clone()
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        Ok(Self { relay, log_level })
    }
}
