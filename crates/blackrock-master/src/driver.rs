//! ---
//! br_section: "04-master"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Fleet master: launches node agents and assigns their roles."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use blackrock_cluster_rpc::AddressToken;
use blackrock_common::MachineConfig;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::{MasterError, Result};

/// Starts (or re-attaches to) the agent on one machine and returns its token.
#[async_trait]
pub trait ComputeDriver: Send + Sync {
    /// Launch the agent for `name`. With `restart` the running agent is replaced.
    async fn launch(&self, name: &str, machine: &MachineConfig, restart: bool)
        -> Result<AddressToken>;
}

/// Runs each machine's configured launch command and reads the token it prints.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    log_sink: Option<String>,
    timeout: Duration,
}

impl CommandDriver {
    /// `log_sink` is forwarded to every agent as `--log <sink>/<machine>`.
    pub fn new(log_sink: Option<String>, timeout: Duration) -> Self {
        Self { log_sink, timeout }
    }

    /// Full argument vector for `name`.
    pub fn command_line(&self, name: &str, machine: &MachineConfig, restart: bool) -> Vec<String> {
        let mut argv = machine.launch.clone();
        if let Some(sink) = &self.log_sink {
            argv.push("--log".to_owned());
            argv.push(format!("{sink}/{name}"));
        }
        if restart {
            argv.push("--restart".to_owned());
        }
        argv
    }
}

#[async_trait]
impl ComputeDriver for CommandDriver {
    #[instrument(skip(self, machine), fields(role = %machine.role))]
    async fn launch(
        &self,
        name: &str,
        machine: &MachineConfig,
        restart: bool,
    ) -> Result<AddressToken> {
        let argv = self.command_line(name, machine, restart);
        let Some((program, args)) = argv.split_first() else {
            return Err(MasterError::Config(format!(
                "machine '{name}' has an empty launch command"
            )));
        };
        debug!(?argv, "launching agent");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MasterError::Launch {
                machine: name.to_owned(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| MasterError::LaunchTimeout {
                machine: name.to_owned(),
                timeout: self.timeout,
            })?
            .map_err(|source| MasterError::Launch {
                machine: name.to_owned(),
                source,
            })?;

        if !output.status.success() {
            return Err(MasterError::LaunchFailed {
                machine: name.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let token = AddressToken::decode(&output.stdout).map_err(|source| MasterError::Rpc {
            machine: name.to_owned(),
            source,
        })?;
        info!(%token, "agent reported");
        Ok(token)
    }
}
