//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! Cross-process singleton built on an advisory `flock` over a well-known file.
//!
//! The file body is the address token of the current (or last) holder. The
//! lock belongs to the open file description, so it survives `fork` and is
//! released by the kernel when the last descriptor closes, including on crash.
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use blackrock_cluster_rpc::{AddressToken, TOKEN_LEN};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{NodeError, Result};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a non-blocking acquisition attempt.
#[derive(Debug)]
pub enum GuardState {
    /// This caller now holds the guard.
    Acquired(SingletonGuard),
    /// Another process holds it. Carries the token found in the file, if any.
    ///
    /// The token may be stale; only a failed dial proves it.
    AlreadyHeld(Option<AddressToken>),
}

/// Exclusive hold on the machine-wide guard file.
pub struct SingletonGuard {
    lock: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for SingletonGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonGuard")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SingletonGuard {
    /// Try once to take the guard.
    pub fn try_acquire(path: &Path) -> Result<GuardState> {
        match Self::lock_nonblocking(path)? {
            Some(guard) => Ok(GuardState::Acquired(guard)),
            None => {
                let token = Self::read_token(path)?;
                debug!(path = %path.display(), token = ?token, "guard already held");
                Ok(GuardState::AlreadyHeld(token))
            }
        }
    }

    /// Poll until the guard is free or `timeout` elapses. `None` waits forever.
    pub async fn wait_acquire(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(guard) = Self::lock_nonblocking(path)? {
                info!(path = %path.display(), waited_ms = started.elapsed().as_millis() as u64, "guard acquired after wait");
                return Ok(guard);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(NodeError::GuardTimeout {
                        path: path.to_path_buf(),
                        waited: started.elapsed(),
                    });
                }
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Read whatever token the guard file currently holds.
    ///
    /// Needs no lock. A missing or empty file yields `None`.
    pub fn read_token(path: &Path) -> Result<Option<AddressToken>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(NodeError::GuardIo {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(AddressToken::decode(&bytes)?))
    }

    /// Record `token` as the address of the current holder.
    ///
    /// The record is written in place with a single positioned write and the
    /// file is then cut to one record. Concurrent readers see either the old
    /// record or the new one.
    pub fn persist(&mut self, token: &AddressToken) -> Result<()> {
        let record = token.encode();
        let file: &File = &self.lock;
        file.write_all_at(&record, 0)
            .and_then(|()| file.set_len(TOKEN_LEN as u64))
            .and_then(|()| file.sync_data())
            .map_err(|source| NodeError::GuardIo {
                path: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), %token, "address token persisted");
        Ok(())
    }

    /// Path of the guard file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly. Dropping the guard has the same effect.
    pub fn release(self) -> Result<()> {
        let path = self.path;
        self.lock
            .unlock()
            .map(drop)
            .map_err(|(_, source)| NodeError::GuardLock { path, source })
    }

    fn lock_nonblocking(path: &Path) -> Result<Option<Self>> {
        let file = open_guard_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(path = %path.display(), "guard lock taken");
                Ok(Some(Self {
                    lock,
                    path: path.to_path_buf(),
                }))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, source)) => Err(NodeError::GuardLock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

fn open_guard_file(path: &Path) -> Result<File> {
    let io_err = |source| NodeError::GuardIo {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
        .map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn token(port: u16) -> AddressToken {
        AddressToken::new(format!("10.0.0.5:{port}").parse().unwrap())
    }

    #[test]
    fn first_acquire_creates_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/blackrock-slave");
        let state = SingletonGuard::try_acquire(&path).unwrap();
        assert!(matches!(state, GuardState::Acquired(_)));
        assert!(path.exists());
        assert_eq!(SingletonGuard::read_token(&path).unwrap(), None);
    }

    #[test]
    fn second_acquire_sees_persisted_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guard");
        let GuardState::Acquired(mut guard) = SingletonGuard::try_acquire(&path).unwrap() else {
            panic!("expected to acquire");
        };
        guard.persist(&token(4000)).unwrap();

        match SingletonGuard::try_acquire(&path).unwrap() {
            GuardState::AlreadyHeld(found) => assert_eq!(found, Some(token(4000))),
            GuardState::Acquired(_) => panic!("guard acquired twice"),
        }
    }

    #[test]
    fn persist_replaces_whole_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guard");
        fs::write(&path, vec![0xAA; TOKEN_LEN * 2]).unwrap();
        let GuardState::Acquired(mut guard) = SingletonGuard::try_acquire(&path).unwrap() else {
            panic!("expected to acquire");
        };
        guard.persist(&token(1)).unwrap();
        guard.persist(&token(2)).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), TOKEN_LEN);
        assert_eq!(SingletonGuard::read_token(&path).unwrap(), Some(token(2)));
    }

    #[test]
    fn release_and_drop_free_the_guard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guard");
        let GuardState::Acquired(guard) = SingletonGuard::try_acquire(&path).unwrap() else {
            panic!("expected to acquire");
        };
        guard.release().unwrap();

        let GuardState::Acquired(guard) = SingletonGuard::try_acquire(&path).unwrap() else {
            panic!("released guard should be free");
        };
        drop(guard);
        assert!(matches!(
            SingletonGuard::try_acquire(&path).unwrap(),
            GuardState::Acquired(_)
        ));
    }

    #[test]
    fn stale_token_survives_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guard");
        let GuardState::Acquired(mut guard) = SingletonGuard::try_acquire(&path).unwrap() else {
            panic!("expected to acquire");
        };
        guard.persist(&token(7)).unwrap();
        drop(guard);
        assert_eq!(SingletonGuard::read_token(&path).unwrap(), Some(token(7)));
    }

    #[tokio::test]
    async fn wait_acquire_times_out_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guard");
        let _held = SingletonGuard::try_acquire(&path).unwrap();
        let err = SingletonGuard::wait_acquire(&path, Some(Duration::from_millis(250)))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::GuardTimeout { .. }));
    }

    #[tokio::test]
    async fn wait_acquire_completes_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guard");
        let GuardState::Acquired(held) = SingletonGuard::try_acquire(&path).unwrap() else {
            panic!("expected to acquire");
        };
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(held);
        });
        let guard = SingletonGuard::wait_acquire(&path, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(guard.path(), path.as_path());
        releaser.await.unwrap();
    }
}
