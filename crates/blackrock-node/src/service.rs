//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::sync::Arc;

use blackrock_cluster_rpc::proto::{self, machine_server::Machine};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::agent::{CapabilityRef, NodeRoleAgent};
use crate::NodeError;

/// gRPC adapter exposing a [`NodeRoleAgent`].
#[derive(Debug, Clone)]
pub struct MachineService {
    agent: Arc<NodeRoleAgent>,
}

impl MachineService {
    /// Serve `agent`.
    pub fn new(agent: Arc<NodeRoleAgent>) -> Self {
        Self { agent }
    }

    /// The agent behind this service.
    pub fn agent(&self) -> &Arc<NodeRoleAgent> {
        &self.agent
    }
}

impl From<&CapabilityRef> for proto::CapabilityRef {
    fn from(cap: &CapabilityRef) -> Self {
        proto::CapabilityRef {
            interface: cap.interface.clone(),
            object_id: cap.object_id.to_string(),
            context_id: cap.context_id.to_string(),
        }
    }
}

fn to_status(err: NodeError) -> Status {
    match err {
        NodeError::CollaboratorConstruction { .. } => Status::unavailable(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl Machine for MachineService {
    async fn become_storage(
        &self,
        request: Request<proto::BecomeStorageRequest>,
    ) -> Result<Response<proto::BecomeStorageResponse>, Status> {
        debug!(peer = ?request.remote_addr(), "become_storage");
        let handles = self.agent.become_storage().await.map_err(to_status)?;
        Ok(Response::new(proto::BecomeStorageResponse {
            root_set: Some(handles.root_set().into()),
            storage_factory: Some(handles.storage_factory().into()),
        }))
    }

    async fn become_worker(
        &self,
        request: Request<proto::BecomeWorkerRequest>,
    ) -> Result<Response<proto::BecomeWorkerResponse>, Status> {
        debug!(peer = ?request.remote_addr(), "become_worker");
        let handles = self.agent.become_worker().await.map_err(to_status)?;
        Ok(Response::new(proto::BecomeWorkerResponse {
            worker: Some(handles.worker().into()),
        }))
    }

    async fn status(
        &self,
        _request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let status = self.agent.status();
        let metrics = match self.agent.metrics() {
            Some(metrics) => metrics.render().map_err(to_status)?,
            None => String::new(),
        };
        Ok(Response::new(proto::StatusResponse {
            pid: status.pid,
            storage_assigned: status.storage_assigned,
            worker_assigned: status.worker_assigned,
            started_at: status.started_at.to_rfc3339(),
            metrics,
        }))
    }
}
