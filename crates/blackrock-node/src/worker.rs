//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::agent::CapabilityRef;

/// Interface name of the worker capability.
pub const WORKER_INTERFACE: &str = "blackrock.Worker";

/// Builds the worker role context. Workload isolation lives behind this seam.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Prepare the host and return its context.
    async fn start(&self) -> anyhow::Result<WorkerContext>;
}

/// Live worker role.
#[derive(Debug)]
pub struct WorkerContext {
    id: Uuid,
    created_at: DateTime<Utc>,
    work_dir: PathBuf,
    worker: CapabilityRef,
}

impl WorkerContext {
    /// Fresh context with a newly minted worker capability.
    pub fn new(work_dir: PathBuf) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            created_at: Utc::now(),
            work_dir,
            worker: CapabilityRef::mint(WORKER_INTERFACE, id),
        }
    }

    /// Unique id of this context.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When this context was built.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Directory workloads run in.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Capability for running grains on this machine.
    pub fn worker(&self) -> &CapabilityRef {
        &self.worker
    }
}

/// Worker host that runs workloads under a local directory.
#[derive(Debug, Clone)]
pub struct LocalWorkerHost {
    root: PathBuf,
}

impl LocalWorkerHost {
    /// Host running workloads under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl WorkerHost for LocalWorkerHost {
    async fn start(&self) -> anyhow::Result<WorkerContext> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create worker dir {}", self.root.display()))?;
        let context = WorkerContext::new(self.root.clone());
        info!(work_dir = %self.root.display(), context = %context.id(), "worker host ready");
        Ok(context)
    }
}
