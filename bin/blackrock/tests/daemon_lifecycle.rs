//! ---
//! br_section: "05-cli"
//! br_subsection: "tests"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Forked agent launch, attach, and forced restart through the real binary."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! Lives in its own test binary: `--restart` terminates every `blackrock
//! slave` on the host, so nothing else may launch agents while it runs.
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use blackrock_cluster_rpc::{AddressToken, MachineConnection, TOKEN_LEN};
use blackrock_node::SingletonGuard;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::tempdir;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_WAIT: Duration = Duration::from_secs(10);

/// Agents started by the test; terminated on the way out, pass or fail.
#[derive(Default)]
struct Daemons(Vec<u32>);

impl Drop for Daemons {
    fn drop(&mut self) {
        for pid in &self.0 {
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGTERM);
        }
    }
}

/// Run `blackrock slave 127.0.0.1` under `root` and return its raw stdout.
fn slave(root: &Path, restart: bool) -> Vec<u8> {
    let mut cmd = Command::cargo_bin("blackrock").unwrap();
    cmd.env_remove("BLACKROCK_CONFIG")
        .env_remove("BLACKROCK_ROOT")
        .args(["slave", "127.0.0.1", "--root"])
        .arg(root)
        .timeout(Duration::from_secs(60));
    if restart {
        cmd.arg("--restart");
    }
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "slave exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    output.stdout
}

fn daemon_pid(token: AddressToken) -> u32 {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut connection = MachineConnection::dial(token, DIAL_TIMEOUT).await.unwrap();
        connection.status().await.unwrap().pid
    })
}

/// Gone means no /proc entry, or a zombie nobody has reaped yet.
fn has_exited(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .is_some_and(|(_, rest)| rest.starts_with('Z')),
        Err(_) => true,
    }
}

fn wait_for_exit(pid: u32) -> bool {
    let deadline = Instant::now() + EXIT_WAIT;
    while Instant::now() < deadline {
        if has_exited(pid) {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    has_exited(pid)
}

#[test]
fn slave_launches_attaches_and_restarts_a_forked_agent() {
    let dir = tempdir().unwrap();
    let guard_path = dir.path().join("run/blackrock-slave");
    let mut daemons = Daemons::default();

    // Fresh machine: the parent prints the forked agent's token and exits.
    let first = slave(dir.path(), false);
    assert_eq!(first.len(), TOKEN_LEN);
    let token = AddressToken::decode(&first).unwrap();
    assert_eq!(token.ip().to_string(), "127.0.0.1");
    assert_ne!(token.port(), 0);
    let pid = daemon_pid(token);
    daemons.0.push(pid);
    assert_ne!(pid, std::process::id());
    assert_eq!(SingletonGuard::read_token(&guard_path).unwrap(), Some(token));

    // Second invocation attaches and reports the same bytes.
    let again = slave(dir.path(), false);
    assert_eq!(again, first);
    assert_eq!(daemon_pid(token), pid);

    // Forced restart replaces the agent and publishes a new token.
    let restarted = slave(dir.path(), true);
    assert_eq!(restarted.len(), TOKEN_LEN);
    let new_token = AddressToken::decode(&restarted).unwrap();
    assert!(new_token.ip().is_loopback());
    let new_pid = daemon_pid(new_token);
    daemons.0.push(new_pid);
    assert_ne!(new_pid, pid);
    assert_eq!(
        SingletonGuard::read_token(&guard_path).unwrap(),
        Some(new_token)
    );
    assert!(wait_for_exit(pid), "agent {pid} survived the restart");
}
