//! ---
//! br_section: "01-core-functionality"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Shared primitives and utilities for the node agent and master."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_guard_path() -> PathBuf {
    PathBuf::from("/var/run/blackrock-slave")
}

fn default_log_address_path() -> PathBuf {
    PathBuf::from("/var/run/blackrock-logsink")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/blackrock/storage")
}

fn default_worker_root() -> PathBuf {
    PathBuf::from("/var/blackrock/worker")
}

fn default_restart_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

fn default_process_name() -> String {
    "blackrock".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("/var/log/blackrock")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_launch_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Errors raised while parsing command-line level configuration values.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bind address must not be empty")]
    EmptyBindAddress,
    #[error("interface name missing after '{0}'")]
    MissingInterface(&'static str),
    #[error("log sink address must not be empty")]
    EmptyLogSink,
}

/// IP family requested when resolving a local interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("ipv4"),
            AddressFamily::Ipv6 => f.write_str("ipv6"),
        }
    }
}

/// Where the slave should listen, as written on the command line.
///
/// `if4:<iface>` and `if6:<iface>` pick the first address of that family on a
/// local interface; anything else is a literal host, optionally with a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindSpec {
    Literal(String),
    Interface { family: AddressFamily, name: String },
}

impl FromStr for BindSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::EmptyBindAddress);
        }
        for (prefix, family) in [("if4:", AddressFamily::Ipv4), ("if6:", AddressFamily::Ipv6)] {
            if let Some(name) = s.strip_prefix(prefix) {
                if name.is_empty() {
                    return Err(ConfigError::MissingInterface(prefix));
                }
                return Ok(BindSpec::Interface {
                    family,
                    name: name.to_owned(),
                });
            }
        }
        Ok(BindSpec::Literal(s.to_owned()))
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindSpec::Literal(host) => f.write_str(host),
            BindSpec::Interface {
                family: AddressFamily::Ipv4,
                name,
            } => write!(f, "if4:{name}"),
            BindSpec::Interface {
                family: AddressFamily::Ipv6,
                name,
            } => write!(f, "if6:{name}"),
        }
    }
}

/// Unresolved `--log <addr>/<name>` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSinkSpec {
    pub address: String,
    pub name: Option<String>,
}

impl FromStr for LogSinkSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (address, name) = match s.split_once('/') {
            Some((address, name)) => (address, Some(name)),
            None => (s, None),
        };
        if address.trim().is_empty() {
            return Err(ConfigError::EmptyLogSink);
        }
        Ok(Self {
            address: address.trim().to_owned(),
            name: name.filter(|n| !n.is_empty()).map(str::to_owned),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Immutable configuration of one `slave` invocation.
///
/// Built once from the command line and shared by reference with the
/// bootstrap; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub bind: BindSpec,
    pub log_sink: Option<LogSinkSpec>,
    pub restart: bool,
    pub guard_path: PathBuf,
    pub log_address_path: PathBuf,
    pub storage_root: PathBuf,
    pub worker_root: PathBuf,
    /// Upper bound on the forced-restart wait. `None` waits indefinitely.
    pub restart_timeout: Option<Duration>,
    /// Command name used to recognise earlier agents in the process table.
    pub process_name: String,
    pub logging: LoggingConfig,
}

impl SlaveConfig {
    pub fn new(bind: BindSpec) -> Self {
        Self {
            bind,
            log_sink: None,
            restart: false,
            guard_path: default_guard_path(),
            log_address_path: default_log_address_path(),
            storage_root: default_storage_root(),
            worker_root: default_worker_root(),
            restart_timeout: default_restart_timeout(),
            process_name: default_process_name(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_log_sink(mut self, log_sink: Option<LogSinkSpec>) -> Self {
        self.log_sink = log_sink;
        self
    }

    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    /// Relocate every machine-global path under `root`. Used by tests and
    /// unprivileged runs.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.guard_path = root.join("run/blackrock-slave");
        self.log_address_path = root.join("run/blackrock-logsink");
        self.storage_root = root.join("blackrock/storage");
        self.worker_root = root.join("blackrock/worker");
        self.logging.directory = root.join("log");
        self
    }
}

/// Role a machine is given by the master.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    Storage,
    Worker,
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineRole::Storage => f.write_str("storage"),
            MachineRole::Worker => f.write_str("worker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub role: MachineRole,
    /// Command that starts (or re-attaches to) the slave on that machine and
    /// prints its address token on stdout.
    pub launch: Vec<String>,
}

/// Master-side description of the fleet.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub log_sink: Option<String>,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_launch_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub launch_timeout: Duration,
    #[serde(default)]
    pub machines: IndexMap<String, MachineConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`FleetConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedFleetConfig {
    pub config: FleetConfig,
    pub source: PathBuf,
}

impl FleetConfig {
    pub const ENV_CONFIG_PATH: &'static str = "BLACKROCK_CONFIG";

    /// Load configuration from disk together with the effective source path,
    /// respecting the `BLACKROCK_CONFIG` override.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedFleetConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedFleetConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedFleetConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading fleet configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<FleetConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn machines_with_role(&self, role: MachineRole) -> impl Iterator<Item = (&str, &MachineConfig)> {
        self.machines
            .iter()
            .filter(move |(_, machine)| machine.role == role)
            .map(|(name, machine)| (name.as_str(), machine))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        let storage = self.machines_with_role(MachineRole::Storage).count();
        if storage == 0 {
            return Err(anyhow!("no storage machine configured"));
        }
        if storage > 1 {
            return Err(anyhow!(
                "exactly one storage machine is supported, found {}",
                storage
            ));
        }
        if self.machines_with_role(MachineRole::Worker).next().is_none() {
            return Err(anyhow!("need at least one worker"));
        }
        for (name, machine) in &self.machines {
            if machine.launch.is_empty() {
                return Err(anyhow!("machine '{}' has an empty launch command", name));
            }
        }
        Ok(())
    }
}

impl FromStr for FleetConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: FleetConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}
