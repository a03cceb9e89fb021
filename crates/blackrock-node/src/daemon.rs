//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! How the serving agent is split off from the process that reports its token.
//!
//! The bootstrap only needs to know which side of the split it is on. The
//! daemon side serves; the reporting side prints the token and exits.
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, fork, pipe, setsid, ForkResult};
use tracing::{info, warn};

use crate::log_sink::LogSinkTarget;
use crate::{NodeError, Result};

const DEV_NULL: &str = "/dev/null";
const READY: u8 = b'R';

/// Where the daemon's stdout and stderr should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioPlan {
    /// Send both to `/dev/null`.
    Discard,
    /// Connect to the collector recorded at `record` and announce `name`.
    LogSink {
        /// File holding the resolved collector address.
        record: PathBuf,
        /// Stream name sent to the collector.
        name: String,
    },
}

/// Which side of the split the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The reporting process.
    Parent {
        /// Pid of the daemon, which is detached and ready.
        child: u32,
    },
    /// The process that must serve.
    Daemon,
}

/// Splits the serving agent from the reporting process.
pub trait Detach {
    /// Split off the daemon, redirecting its stdio per `stdio`.
    fn detach(&self, stdio: &StdioPlan) -> Result<Detached>;
}

/// Forks a session-leader daemon with redirected stdio.
///
/// The parent returns only once the child has finished detaching, so a
/// failed `setsid` or stdio redirect surfaces as an error in the reporting
/// process instead of a token for an agent that never came up.
///
/// The caller must be single threaded: no runtime, no background writers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkDetacher;

impl Detach for ForkDetacher {
    fn detach(&self, stdio: &StdioPlan) -> Result<Detached> {
        let (read_end, write_end) = pipe().map_err(|source| NodeError::Daemonize {
            step: "readiness pipe",
            source,
        })?;
        // SAFETY: the bootstrap runs this before any runtime or helper thread
        // exists, so the child starts from a consistent single-threaded state.
        let forked = unsafe { fork() }.map_err(|source| NodeError::Daemonize {
            step: "fork",
            source,
        })?;
        match forked {
            ForkResult::Parent { child } => {
                drop(write_end);
                let ready = await_ready(File::from(read_end), child.as_raw().unsigned_abs());
                if ready.is_err() {
                    // Reap it; the child has already given up.
                    let _ = waitpid(child, None);
                }
                ready
            }
            ForkResult::Child => {
                drop(read_end);
                setsid().map_err(|source| NodeError::Daemonize {
                    step: "setsid",
                    source,
                })?;
                redirect_stdio(stdio)?;
                if let Err(err) = signal_ready(File::from(write_end)) {
                    warn!(error = %err, "reporting process went away before readiness");
                }
                info!(pid = std::process::id(), "agent daemon detached");
                Ok(Detached::Daemon)
            }
        }
    }
}

/// Tell the reporting process the daemon is detached. Dropping `ready`
/// without calling this reads as a startup failure on the other end.
fn signal_ready(mut ready: File) -> Result<()> {
    ready.write_all(&[READY])?;
    Ok(())
}

fn await_ready(mut ready: File, child: u32) -> Result<Detached> {
    let mut byte = [0u8; 1];
    match ready.read_exact(&mut byte) {
        Ok(()) if byte[0] == READY => Ok(Detached::Parent { child }),
        Ok(()) => Err(NodeError::DaemonStartup { child }),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
            Err(NodeError::DaemonStartup { child })
        }
        Err(err) => Err(err.into()),
    }
}

/// Keeps serving in the calling process. Stdio is left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForegroundDetacher;

impl Detach for ForegroundDetacher {
    fn detach(&self, _stdio: &StdioPlan) -> Result<Detached> {
        Ok(Detached::Daemon)
    }
}

fn open_null() -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(DEV_NULL)?)
}

fn redirect_stdio(plan: &StdioPlan) -> Result<()> {
    let null = open_null()?;
    point_at(&null, STDIN_FILENO, "redirect stdin")?;

    let output: OwnedFd = match plan {
        StdioPlan::Discard => null.into(),
        StdioPlan::LogSink { record, name } => match LogSinkTarget::load(record, name) {
            Ok(Some(target)) => match target.connect() {
                Ok(stream) => stream.into(),
                Err(err) => {
                    warn!(error = %err, "log sink unreachable; discarding output");
                    null.into()
                }
            },
            Ok(None) => {
                warn!(record = %record.display(), "no log sink recorded; discarding output");
                null.into()
            }
            Err(err) => {
                warn!(error = %err, "unreadable log sink record; discarding output");
                null.into()
            }
        },
    };
    point_at(&output, STDOUT_FILENO, "redirect stdout")?;
    point_at(&output, STDERR_FILENO, "redirect stderr")?;
    Ok(())
}

fn point_at(fd: &impl AsRawFd, target: i32, step: &'static str) -> Result<()> {
    dup2(fd.as_raw_fd(), target)
        .map(drop)
        .map_err(|source| NodeError::Daemonize { step, source })
}
