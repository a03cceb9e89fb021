//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! Forced restart: signal earlier agents, then let the guard wait confirm they
//! are gone. Nothing here sleeps or polls for exit.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};

/// Argument that marks an agent invocation on the command line.
const AGENT_SUBCOMMAND: &str = "slave";

/// One row of the live process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Process id.
    pub pid: u32,
    /// Command name as reported by the kernel.
    pub name: String,
    /// Full argument vector; empty when the platform hides it.
    pub cmdline: Vec<String>,
}

/// Source of process table snapshots.
pub trait ProcessTable {
    /// Current processes. Entries may vanish before they are signalled.
    fn snapshot(&mut self) -> Vec<ProcessEntry>;
}

/// Delivers the termination signal.
pub trait Signaller {
    /// Ask `pid` to shut down. `ESRCH` means it is already gone.
    fn terminate(&self, pid: u32) -> nix::Result<()>;
}

/// Process table read through `sysinfo`.
pub struct SysinfoProcessTable {
    system: System,
}

impl SysinfoProcessTable {
    /// Empty table; refreshed on every snapshot.
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn snapshot(&mut self) -> Vec<ProcessEntry> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
        );
        self.system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                cmdline: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect()
    }
}

/// Sends `SIGTERM` with `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn terminate(&self, pid: u32) -> nix::Result<()> {
        let pid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
        kill(Pid::from_raw(pid), Signal::SIGTERM)
    }
}

/// What a termination pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestartReport {
    /// Pids that accepted the signal.
    pub signalled: Vec<u32>,
    /// Pids that exited between enumeration and signalling.
    pub vanished: Vec<u32>,
    /// Pids the signal could not be delivered to.
    pub failed: Vec<(u32, Errno)>,
}

/// Terminates earlier agent instances on this machine.
pub struct FleetRestartCoordinator<P = SysinfoProcessTable, S = NixSignaller> {
    table: P,
    signaller: S,
    process_name: String,
}

impl FleetRestartCoordinator {
    /// Coordinator over the real process table.
    pub fn for_process_name(process_name: impl Into<String>) -> Self {
        Self::new(SysinfoProcessTable::new(), NixSignaller, process_name)
    }
}

impl<P: ProcessTable, S: Signaller> FleetRestartCoordinator<P, S> {
    /// Coordinator matching agents named `process_name`.
    pub fn new(table: P, signaller: S, process_name: impl Into<String>) -> Self {
        Self {
            table,
            signaller,
            process_name: process_name.into(),
        }
    }

    /// Signal every other agent process. Does not wait for them to exit.
    pub fn terminate_prior_instances(&mut self, self_pid: u32) -> RestartReport {
        let mut report = RestartReport::default();
        let candidates: Vec<_> = self
            .table
            .snapshot()
            .into_iter()
            .filter(|entry| entry.pid != self_pid && self.is_agent(entry))
            .collect();
        debug!(count = candidates.len(), "prior agent instances found");

        for entry in candidates {
            match self.signaller.terminate(entry.pid) {
                Ok(()) => {
                    info!(pid = entry.pid, "sent SIGTERM to prior agent");
                    report.signalled.push(entry.pid);
                }
                Err(Errno::ESRCH) => {
                    debug!(pid = entry.pid, "prior agent already exited");
                    report.vanished.push(entry.pid);
                }
                Err(errno) => {
                    warn!(pid = entry.pid, error = %errno, "failed to signal prior agent");
                    report.failed.push((entry.pid, errno));
                }
            }
        }
        report
    }

    fn is_agent(&self, entry: &ProcessEntry) -> bool {
        if entry.name != self.process_name {
            return false;
        }
        // Other subcommands share the binary name.
        entry.cmdline.is_empty() || entry.cmdline.iter().skip(1).any(|arg| arg == AGENT_SUBCOMMAND)
    }
}
