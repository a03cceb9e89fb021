//! ---
//! br_section: "04-master"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Fleet master: launches node agents and assigns their roles."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! Fleet master.
//!
//! Machine provisioning is behind [`driver::ComputeDriver`]; the master only
//! needs each machine's address token to dial it and hand out roles.
#![warn(missing_docs)]

use std::process::ExitStatus;
use std::time::Duration;

use blackrock_cluster_rpc::RpcError;

pub mod driver;
pub mod fleet;

/// Result alias used by the master.
pub type Result<T> = std::result::Result<T, MasterError>;

/// Errors raised while bringing a fleet up.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// The fleet description is unusable.
    #[error("invalid fleet configuration: {0}")]
    Config(String),
    /// The launch command could not be started.
    #[error("failed to launch machine '{machine}': {source}")]
    Launch {
        /// Machine name.
        machine: String,
        /// Spawn failure.
        #[source]
        source: std::io::Error,
    },
    /// The launch command exited unsuccessfully.
    #[error("machine '{machine}' launch exited with {status}: {stderr}")]
    LaunchFailed {
        /// Machine name.
        machine: String,
        /// Exit status of the launch command.
        status: ExitStatus,
        /// Captured stderr, trimmed.
        stderr: String,
    },
    /// The launch command did not finish in time.
    #[error("machine '{machine}' did not report a token within {timeout:?}")]
    LaunchTimeout {
        /// Machine name.
        machine: String,
        /// Configured limit.
        timeout: Duration,
    },
    /// Token decoding, dialing, or a role call failed.
    #[error("machine '{machine}': {source}")]
    Rpc {
        /// Machine name.
        machine: String,
        /// Underlying failure.
        #[source]
        source: RpcError,
    },
}

pub use driver::{CommandDriver, ComputeDriver};
pub use fleet::{assign_roles, Fleet, MachineHandle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = MasterError::Config("need at least one worker".into());
        assert_eq!(
            err.to_string(),
            "invalid fleet configuration: need at least one worker"
        );
    }
}
