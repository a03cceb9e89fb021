//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! Startup of one `slave` invocation.
//!
//! [`DaemonBootstrap::acquire`] settles who owns the machine: either another
//! agent already does and its token is reported, or this process takes the
//! guard (after a forced restart if asked). [`DaemonBootstrap::launch`] then
//! binds the transport, persists the token, and detaches. It is synchronous
//! so that it can run after the acquisition runtime has been torn down.
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use blackrock_cluster_rpc::{AddressToken, ReconnectableTransport};
use blackrock_common::SlaveConfig;
use prometheus::Registry;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::agent::NodeRoleAgent;
use crate::daemon::{Detach, Detached, StdioPlan};
use crate::guard::{GuardState, SingletonGuard};
use crate::log_sink::LogSinkTarget;
use crate::metrics::NodeMetrics;
use crate::restart::{FleetRestartCoordinator, ProcessTable, Signaller};
use crate::service::MachineService;
use crate::storage::FilesystemStorageEngine;
use crate::worker::LocalWorkerHost;
use crate::{NodeError, Result};

const TOKEN_PUBLISH_WAIT: Duration = Duration::from_secs(2);
const TOKEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of the acquisition step.
#[derive(Debug)]
pub enum Acquisition {
    /// Another agent runs here; this is its token.
    Attached(AddressToken),
    /// This process holds the guard and must launch the agent.
    Acquired(SingletonGuard),
}

/// Terminal state of the bootstrap, from the point of view of the caller.
#[derive(Debug)]
pub enum BootstrapOutcome {
    /// An agent was already running. Nothing was started.
    Attached(AddressToken),
    /// A daemon was started and is serving at this token. Report it and exit.
    Serving(AddressToken),
    /// This process is the agent and must serve.
    Daemon(DaemonContext),
}

impl BootstrapOutcome {
    /// Token to report to the invoking caller.
    pub fn token(&self) -> AddressToken {
        match self {
            BootstrapOutcome::Attached(token) | BootstrapOutcome::Serving(token) => *token,
            BootstrapOutcome::Daemon(context) => context.token,
        }
    }
}

/// Everything the serving agent owns.
#[derive(Debug)]
pub struct DaemonContext {
    /// Held until the agent stops.
    pub guard: SingletonGuard,
    /// Bound transport the agent is served on.
    pub transport: ReconnectableTransport,
    /// Token persisted in the guard file.
    pub token: AddressToken,
}

impl DaemonContext {
    /// Serve `agent` until `shutdown` resolves, then release the guard.
    pub async fn serve<F>(self, agent: Arc<NodeRoleAgent>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let DaemonContext {
            guard,
            transport,
            token,
        } = self;
        info!(%token, "agent serving");
        transport
            .serve(MachineService::new(agent), shutdown)
            .await?;
        guard.release()?;
        info!(%token, "agent stopped; guard released");
        Ok(())
    }
}

/// Drives guard acquisition, transport setup, and detaching.
#[derive(Debug, Clone)]
pub struct DaemonBootstrap {
    config: Arc<SlaveConfig>,
}

impl DaemonBootstrap {
    /// Bootstrap for one `slave` invocation.
    pub fn new(config: Arc<SlaveConfig>) -> Self {
        Self { config }
    }

    /// Configuration the bootstrap was built with.
    pub fn config(&self) -> &SlaveConfig {
        &self.config
    }

    /// Decide who owns this machine, using the real process table on restart.
    pub async fn acquire(&self) -> Result<Acquisition> {
        let mut coordinator = FleetRestartCoordinator::for_process_name(&self.config.process_name);
        self.acquire_with(&mut coordinator).await
    }

    /// Like [`DaemonBootstrap::acquire`] with an explicit restart coordinator.
    pub async fn acquire_with<P, S>(
        &self,
        coordinator: &mut FleetRestartCoordinator<P, S>,
    ) -> Result<Acquisition>
    where
        P: ProcessTable,
        S: Signaller,
    {
        let path = self.config.guard_path.as_path();
        if self.config.restart {
            let report = coordinator.terminate_prior_instances(std::process::id());
            info!(
                signalled = ?report.signalled,
                vanished = ?report.vanished,
                failed = report.failed.len(),
                "forced restart: waiting for guard"
            );
            let guard = SingletonGuard::wait_acquire(path, self.config.restart_timeout).await?;
            return Ok(Acquisition::Acquired(guard));
        }

        match SingletonGuard::try_acquire(path)? {
            GuardState::Acquired(guard) => Ok(Acquisition::Acquired(guard)),
            GuardState::AlreadyHeld(Some(token)) => {
                info!(%token, "agent already running");
                Ok(Acquisition::Attached(token))
            }
            GuardState::AlreadyHeld(None) => {
                let token = await_published_token(path).await?;
                info!(%token, "agent already running");
                Ok(Acquisition::Attached(token))
            }
        }
    }

    /// Bind, persist the token, and split off the daemon.
    ///
    /// Fails without detaching if the log sink, bind, or persist fails.
    pub fn launch(&self, guard: SingletonGuard, detacher: &dyn Detach) -> Result<BootstrapOutcome> {
        let mut guard = guard;
        let stdio = self.prepare_stdio()?;
        let transport = ReconnectableTransport::bind_spec(&self.config.bind)?;
        let token = transport.token();
        guard.persist(&token)?;

        match detacher.detach(&stdio)? {
            Detached::Parent { child } => {
                info!(child, %token, "agent daemon started");
                // The daemon shares the lock; unlocking here would release it there.
                std::mem::forget(guard);
                drop(transport);
                Ok(BootstrapOutcome::Serving(token))
            }
            Detached::Daemon => Ok(BootstrapOutcome::Daemon(DaemonContext {
                guard,
                transport,
                token,
            })),
        }
    }

    /// [`DaemonBootstrap::acquire`] followed by [`DaemonBootstrap::launch`].
    pub async fn run(&self, detacher: &dyn Detach) -> Result<BootstrapOutcome> {
        match self.acquire().await? {
            Acquisition::Attached(token) => Ok(BootstrapOutcome::Attached(token)),
            Acquisition::Acquired(guard) => self.launch(guard, detacher),
        }
    }

    /// Role agent backed by the configured storage and worker directories.
    pub fn build_agent(&self, registry: &Registry) -> Result<NodeRoleAgent> {
        let metrics = NodeMetrics::new(registry)?;
        Ok(NodeRoleAgent::new(
            Arc::new(FilesystemStorageEngine::new(&self.config.storage_root)),
            Arc::new(LocalWorkerHost::new(&self.config.worker_root)),
        )
        .with_metrics(metrics))
    }

    fn prepare_stdio(&self) -> Result<StdioPlan> {
        let Some(spec) = &self.config.log_sink else {
            return Ok(StdioPlan::Discard);
        };
        let target = LogSinkTarget::resolve(spec)?;
        target.persist(&self.config.log_address_path)?;
        Ok(StdioPlan::LogSink {
            record: self.config.log_address_path.clone(),
            name: target.name().to_owned(),
        })
    }
}

/// The holder may not have written its token yet; give it a moment.
async fn await_published_token(path: &Path) -> Result<AddressToken> {
    let deadline = Instant::now() + TOKEN_PUBLISH_WAIT;
    loop {
        if let Some(token) = SingletonGuard::read_token(path)? {
            return Ok(token);
        }
        if Instant::now() >= deadline {
            warn!(path = %path.display(), "guard holder never published a token");
            return Err(NodeError::NoTokenPublished {
                path: path.to_path_buf(),
            });
        }
        tokio::time::sleep(TOKEN_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use blackrock_common::BindSpec;
    use tempfile::tempdir;

    use super::*;
    use crate::daemon::ForegroundDetacher;

    fn config(root: &Path) -> Arc<SlaveConfig> {
        Arc::new(SlaveConfig::new(BindSpec::Literal("127.0.0.1".into())).rooted_at(root))
    }

    #[tokio::test]
    async fn fresh_machine_launches_and_persists() {
        let dir = tempdir().unwrap();
        let bootstrap = DaemonBootstrap::new(config(dir.path()));
        let outcome = bootstrap.run(&ForegroundDetacher).await.unwrap();
        let token = outcome.token();
        assert!(matches!(outcome, BootstrapOutcome::Daemon(_)));
        assert!(token.ip().is_loopback());
        assert_ne!(token.port(), 0);
        assert_eq!(
            SingletonGuard::read_token(&bootstrap.config().guard_path).unwrap(),
            Some(token)
        );
    }

    #[tokio::test]
    async fn second_invocation_attaches() {
        let dir = tempdir().unwrap();
        let bootstrap = DaemonBootstrap::new(config(dir.path()));
        let first = bootstrap.run(&ForegroundDetacher).await.unwrap();
        let second = bootstrap.run(&ForegroundDetacher).await.unwrap();
        match second {
            BootstrapOutcome::Attached(token) => assert_eq!(token, first.token()),
            other => panic!("expected attach, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn held_guard_without_token_is_reported() {
        let dir = tempdir().unwrap();
        let bootstrap = DaemonBootstrap::new(config(dir.path()));
        let _holder = SingletonGuard::try_acquire(&bootstrap.config().guard_path).unwrap();
        let err = bootstrap.acquire().await.unwrap_err();
        assert!(matches!(err, NodeError::NoTokenPublished { .. }));
    }

    #[tokio::test]
    async fn unreachable_log_sink_aborts_before_bind() {
        let dir = tempdir().unwrap();
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let config = SlaveConfig::new(BindSpec::Literal("127.0.0.1".into()))
            .rooted_at(dir.path())
            .with_log_sink(Some(format!("{dead}/w1").parse().unwrap()));
        let bootstrap = DaemonBootstrap::new(Arc::new(config));
        let err = bootstrap.run(&ForegroundDetacher).await.unwrap_err();
        assert!(matches!(err, NodeError::LogSink { .. }));
        assert_eq!(
            SingletonGuard::read_token(&bootstrap.config().guard_path).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn log_sink_is_recorded_for_the_daemon() {
        let dir = tempdir().unwrap();
        let collector = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = collector.local_addr().unwrap();
        let config = SlaveConfig::new(BindSpec::Literal("127.0.0.1".into()))
            .rooted_at(dir.path())
            .with_log_sink(Some(format!("{address}/storage0").parse().unwrap()));
        let bootstrap = DaemonBootstrap::new(Arc::new(config));
        bootstrap.run(&ForegroundDetacher).await.unwrap();
        let recorded =
            LogSinkTarget::load(&bootstrap.config().log_address_path, "storage0").unwrap();
        assert_eq!(recorded.map(|t| t.address()), Some(address));
    }
}
