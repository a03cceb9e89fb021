//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! The per-machine agent.
//!
//! [`bootstrap::DaemonBootstrap`] takes the [`guard::SingletonGuard`], binds a
//! transport, persists its token, detaches, and serves a
//! [`agent::NodeRoleAgent`] over it. A forced restart first asks the
//! [`restart::FleetRestartCoordinator`] to terminate earlier agents.
#![warn(missing_docs)]

use std::path::PathBuf;
use std::time::Duration;

use blackrock_cluster_rpc::RpcError;
use blackrock_common::MachineRole;
use nix::errno::Errno;

/// Result alias used throughout the node crate.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Error type for the node lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Opening, reading, or writing the guard file failed.
    #[error("guard file {path:?}: {source}")]
    GuardIo {
        /// Guard file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The lock call itself failed for a reason other than contention.
    #[error("failed to lock guard file {path:?}: {source}")]
    GuardLock {
        /// Guard file path.
        path: PathBuf,
        /// Errno reported by `flock`.
        #[source]
        source: Errno,
    },
    /// The guard was not released within the allowed wait.
    #[error("guard {path:?} still held after {waited:?}")]
    GuardTimeout {
        /// Guard file path.
        path: PathBuf,
        /// How long acquisition was attempted.
        waited: Duration,
    },
    /// The guard is held but its holder never published a token.
    #[error("guard {path:?} is held but no address token was published")]
    NoTokenPublished {
        /// Guard file path.
        path: PathBuf,
    },
    /// Address token or transport failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// A role context could not be built on first use. The slot stays empty.
    #[error("failed to construct {role} context: {source}")]
    CollaboratorConstruction {
        /// Role whose construction failed.
        role: MachineRole,
        /// Collaborator error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// A detach syscall failed.
    #[error("daemonize step '{step}' failed: {source}")]
    Daemonize {
        /// Which step failed.
        step: &'static str,
        /// Errno from the syscall.
        #[source]
        source: Errno,
    },
    /// The forked daemon closed its readiness pipe without reporting ready.
    #[error("agent daemon {child} exited before it was ready")]
    DaemonStartup {
        /// Pid of the forked daemon.
        child: u32,
    },
    /// The log collector could not be reached or recorded.
    #[error("log sink {address}: {source}")]
    LogSink {
        /// Collector address as given.
        address: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Wrapper for Prometheus registration and encoding failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// Wrapper for IO errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub mod agent;
pub mod bootstrap;
pub mod daemon;
pub mod guard;
pub mod log_sink;
pub mod metrics;
pub mod restart;
pub mod service;
pub mod storage;
pub mod worker;

pub use agent::{
    AgentStatus, CapabilityRef, NodeRoleAgent, RoleHandle, StorageHandles, WorkerHandles,
};
pub use bootstrap::{Acquisition, BootstrapOutcome, DaemonBootstrap, DaemonContext};
pub use daemon::{Detach, Detached, ForegroundDetacher, ForkDetacher, StdioPlan};
pub use guard::{GuardState, SingletonGuard};
pub use log_sink::LogSinkTarget;
pub use metrics::{NodeMetrics, RequestOutcome};
pub use restart::{
    FleetRestartCoordinator, NixSignaller, ProcessEntry, ProcessTable, RestartReport, Signaller,
    SysinfoProcessTable,
};
pub use service::MachineService;
pub use storage::{FilesystemStorageEngine, StorageContext, StorageEngine};
pub use worker::{LocalWorkerHost, WorkerContext, WorkerHost};
