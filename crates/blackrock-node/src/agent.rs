//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! The role agent served to the master.
//!
//! Each role has one slot, filled by the first successful request and then
//! immutable. Later requests for the same role, over any connection, get
//! handles to the same context. Both roles may be held at once.
use std::sync::Arc;

use blackrock_common::MachineRole;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::metrics::{NodeMetrics, RequestOutcome};
use crate::storage::{StorageContext, StorageEngine};
use crate::worker::{WorkerContext, WorkerHost};
use crate::{NodeError, Result};

/// Reference to a capability exported by a role context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CapabilityRef {
    /// Interface the capability implements.
    pub interface: String,
    /// Identity of the exported object.
    pub object_id: Uuid,
    /// Context the object belongs to.
    pub context_id: Uuid,
}

impl CapabilityRef {
    /// Mint a fresh capability for `interface` inside context `context_id`.
    pub fn mint(interface: &str, context_id: Uuid) -> Self {
        Self {
            interface: interface.to_owned(),
            object_id: Uuid::new_v4(),
            context_id,
        }
    }
}

/// Handles to the storage role. Cheap to clone and may outlive the request.
#[derive(Debug, Clone)]
pub struct StorageHandles(Arc<StorageContext>);

impl StorageHandles {
    /// Capability for the root set of grains.
    pub fn root_set(&self) -> &CapabilityRef {
        self.0.root_set()
    }

    /// Capability for creating new storage objects.
    pub fn storage_factory(&self) -> &CapabilityRef {
        self.0.storage_factory()
    }

    /// The storage context behind these handles.
    pub fn context(&self) -> &StorageContext {
        &self.0
    }

    /// True when both handles wrap the same context instance.
    pub fn same_context(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Handles to the worker role.
#[derive(Debug, Clone)]
pub struct WorkerHandles(Arc<WorkerContext>);

impl WorkerHandles {
    /// Capability for running grains on this machine.
    pub fn worker(&self) -> &CapabilityRef {
        self.0.worker()
    }

    /// The worker context behind this handle.
    pub fn context(&self) -> &WorkerContext {
        &self.0
    }

    /// True when both handles wrap the same context instance.
    pub fn same_context(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Handle for a role requested by name.
#[derive(Debug, Clone)]
pub enum RoleHandle {
    /// Storage role handles.
    Storage(StorageHandles),
    /// Worker role handle.
    Worker(WorkerHandles),
}

impl RoleHandle {
    /// Role these handles belong to.
    pub fn role(&self) -> MachineRole {
        match self {
            RoleHandle::Storage(_) => MachineRole::Storage,
            RoleHandle::Worker(_) => MachineRole::Worker,
        }
    }
}

/// Snapshot of the agent for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    /// Pid of the serving process.
    pub pid: u32,
    /// Storage slot is populated.
    pub storage_assigned: bool,
    /// Worker slot is populated.
    pub worker_assigned: bool,
    /// When the agent was created.
    pub started_at: DateTime<Utc>,
}

/// Idempotent role assignment over two independent slots.
pub struct NodeRoleAgent {
    storage_engine: Arc<dyn StorageEngine>,
    worker_host: Arc<dyn WorkerHost>,
    storage: OnceCell<Arc<StorageContext>>,
    worker: OnceCell<Arc<WorkerContext>>,
    metrics: Option<NodeMetrics>,
    started_at: DateTime<Utc>,
}

impl NodeRoleAgent {
    /// Agent with both slots empty and no metrics.
    pub fn new(storage_engine: Arc<dyn StorageEngine>, worker_host: Arc<dyn WorkerHost>) -> Self {
        Self {
            storage_engine,
            worker_host,
            storage: OnceCell::new(),
            worker: OnceCell::new(),
            metrics: None,
            started_at: Utc::now(),
        }
    }

    /// Attach metrics; construction and request counts are recorded from then on.
    pub fn with_metrics(mut self, metrics: NodeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Return the storage role, building it on the first call.
    ///
    /// Concurrent first calls wait on one construction. If construction fails
    /// or the call is cancelled the slot stays empty and a retry starts over.
    #[instrument(skip(self))]
    pub async fn become_storage(&self) -> Result<StorageHandles> {
        let mut created = false;
        let flag = &mut created;
        let result = self
            .storage
            .get_or_try_init(|| async move {
                let context = self.storage_engine.open().await.map_err(|source| {
                    NodeError::CollaboratorConstruction {
                        role: MachineRole::Storage,
                        source: source.into(),
                    }
                })?;
                *flag = true;
                Ok::<_, NodeError>(Arc::new(context))
            })
            .await;
        let context = self.settle(MachineRole::Storage, result, created)?;
        if created {
            info!(context = %context.id(), root = %context.root().display(), "storage role assigned");
        }
        Ok(StorageHandles(Arc::clone(context)))
    }

    /// Return the worker role, building it on the first call.
    #[instrument(skip(self))]
    pub async fn become_worker(&self) -> Result<WorkerHandles> {
        let mut created = false;
        let flag = &mut created;
        let result = self
            .worker
            .get_or_try_init(|| async move {
                let context = self.worker_host.start().await.map_err(|source| {
                    NodeError::CollaboratorConstruction {
                        role: MachineRole::Worker,
                        source: source.into(),
                    }
                })?;
                *flag = true;
                Ok::<_, NodeError>(Arc::new(context))
            })
            .await;
        let context = self.settle(MachineRole::Worker, result, created)?;
        if created {
            info!(context = %context.id(), work_dir = %context.work_dir().display(), "worker role assigned");
        }
        Ok(WorkerHandles(Arc::clone(context)))
    }

    /// Request a role by name.
    pub async fn become_role(&self, role: MachineRole) -> Result<RoleHandle> {
        match role {
            MachineRole::Storage => self.become_storage().await.map(RoleHandle::Storage),
            MachineRole::Worker => self.become_worker().await.map(RoleHandle::Worker),
        }
    }

    /// Metrics attached with [`NodeRoleAgent::with_metrics`], if any.
    pub fn metrics(&self) -> Option<&NodeMetrics> {
        self.metrics.as_ref()
    }

    /// Pid, populated slots, and start time.
    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            pid: std::process::id(),
            storage_assigned: self.storage.initialized(),
            worker_assigned: self.worker.initialized(),
            started_at: self.started_at,
        }
    }

    fn settle<'a, T>(
        &self,
        role: MachineRole,
        result: Result<&'a T>,
        created: bool,
    ) -> Result<&'a T> {
        let outcome = match (&result, created) {
            (Err(err), _) => {
                warn!(%role, error = %err, "role construction failed");
                RequestOutcome::Failed
            }
            (Ok(_), true) => RequestOutcome::Created,
            (Ok(_), false) => RequestOutcome::Reused,
        };
        if let Some(metrics) = &self.metrics {
            if outcome == RequestOutcome::Created {
                metrics.record_constructed(role);
            }
            metrics.record_request(role, outcome);
        }
        result
    }
}

impl std::fmt::Debug for NodeRoleAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRoleAgent")
            .field("storage_assigned", &self.storage.initialized())
            .field("worker_assigned", &self.worker.initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use prometheus::Registry;

    use super::*;

    #[derive(Default)]
    struct CountingEngine {
        opens: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl StorageEngine for CountingEngine {
        async fn open(&self) -> anyhow::Result<StorageContext> {
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && attempt == 0 {
                anyhow::bail!("disk not ready");
            }
            Ok(StorageContext::new(PathBuf::from("/tmp/storage")))
        }
    }

    #[derive(Default)]
    struct CountingHost {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl WorkerHost for CountingHost {
        async fn start(&self) -> anyhow::Result<WorkerContext> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(WorkerContext::new(PathBuf::from("/tmp/worker")))
        }
    }

    fn agent(engine: Arc<CountingEngine>, host: Arc<CountingHost>) -> NodeRoleAgent {
        NodeRoleAgent::new(engine, host)
    }

    #[tokio::test]
    async fn repeated_storage_requests_share_one_context() {
        let engine = Arc::new(CountingEngine::default());
        let agent = agent(engine.clone(), Arc::new(CountingHost::default()));
        let first = agent.become_storage().await.unwrap();
        let second = agent.become_storage().await.unwrap();
        assert!(first.same_context(&second));
        assert_eq!(first.root_set(), second.root_set());
        assert_eq!(engine.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_construct_once() {
        let engine = Arc::new(CountingEngine::default());
        let agent = Arc::new(agent(engine.clone(), Arc::new(CountingHost::default())));
        let calls: Vec<_> = (0..8)
            .map(|_| {
                let agent = Arc::clone(&agent);
                tokio::spawn(async move { agent.become_storage().await.unwrap() })
            })
            .collect();
        let handles = futures::future::try_join_all(calls).await.unwrap();
        assert!(handles.windows(2).all(|pair| pair[0].same_context(&pair[1])));
        assert_eq!(engine.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_construction_leaves_slot_empty_for_retry() {
        let engine = Arc::new(CountingEngine {
            fail_first: true,
            ..Default::default()
        });
        let registry = Registry::new();
        let metrics = NodeMetrics::new(&registry).unwrap();
        let agent = agent(engine.clone(), Arc::new(CountingHost::default())).with_metrics(metrics.clone());

        let err = agent.become_storage().await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::CollaboratorConstruction {
                role: MachineRole::Storage,
                ..
            }
        ));
        assert!(!agent.status().storage_assigned);

        agent.become_storage().await.unwrap();
        assert!(agent.status().storage_assigned);
        assert_eq!(engine.opens.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.requests(MachineRole::Storage, RequestOutcome::Failed), 1);
        assert_eq!(metrics.constructed(MachineRole::Storage), 1);
    }

    #[tokio::test]
    async fn cancelled_construction_can_be_retried() {
        let engine = Arc::new(CountingEngine::default());
        let agent = agent(engine.clone(), Arc::new(CountingHost::default()));
        let cancelled =
            tokio::time::timeout(Duration::from_millis(1), agent.become_storage()).await;
        assert!(cancelled.is_err());
        assert!(!agent.status().storage_assigned);
        agent.become_storage().await.unwrap();
        assert!(agent.status().storage_assigned);
    }

    #[tokio::test]
    async fn roles_are_independent() {
        let engine = Arc::new(CountingEngine::default());
        let host = Arc::new(CountingHost::default());
        let registry = Registry::new();
        let metrics = NodeMetrics::new(&registry).unwrap();
        let agent = agent(engine.clone(), host.clone()).with_metrics(metrics.clone());

        let worker = agent.become_worker().await.unwrap();
        assert!(!agent.status().storage_assigned);
        let storage = agent.become_role(MachineRole::Storage).await.unwrap();
        assert_eq!(storage.role(), MachineRole::Storage);
        let RoleHandle::Worker(again) = agent.become_role(MachineRole::Worker).await.unwrap() else {
            panic!("expected worker handle");
        };
        assert!(worker.same_context(&again));
        assert_eq!(host.starts.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.requests(MachineRole::Worker, RequestOutcome::Reused), 1);

        let status = agent.status();
        assert!(status.storage_assigned && status.worker_assigned);
        assert_eq!(status.pid, std::process::id());
    }
}
