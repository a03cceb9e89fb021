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
use std::time::Duration;

use blackrock_cluster_rpc::{MachineConnection, ReconnectableTransport};
use blackrock_common::MachineRole;
use blackrock_node::storage::SETUP_MARKER;
use blackrock_node::{
    FilesystemStorageEngine, LocalWorkerHost, MachineService, NodeMetrics, NodeRoleAgent,
    RequestOutcome,
};
use prometheus::Registry;
use tempfile::tempdir;
use tokio::sync::oneshot;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnecting_master_gets_the_same_storage() {
    let dir = tempdir().unwrap();
    let storage_root = dir.path().join("storage");
    let registry = Registry::new();
    let metrics = NodeMetrics::new(&registry).unwrap();
    let agent = Arc::new(
        NodeRoleAgent::new(
            Arc::new(FilesystemStorageEngine::new(&storage_root)),
            Arc::new(LocalWorkerHost::new(dir.path().join("worker"))),
        )
        .with_metrics(metrics.clone()),
    );

    let transport = ReconnectableTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let token = transport.token();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(transport.serve(MachineService::new(agent.clone()), async {
        let _ = stop_rx.await;
    }));

    let mut first = MachineConnection::dial(token, DIAL_TIMEOUT).await.unwrap();
    let a = first.become_storage().await.unwrap();
    let marker = std::fs::read_to_string(storage_root.join(SETUP_MARKER)).unwrap();
    drop(first);

    let mut second = MachineConnection::dial(token, DIAL_TIMEOUT).await.unwrap();
    let b = second.become_storage().await.unwrap();

    assert_eq!(a.root_set, b.root_set);
    assert_eq!(a.storage_factory, b.storage_factory);
    assert_eq!(
        std::fs::read_to_string(storage_root.join(SETUP_MARKER)).unwrap(),
        marker
    );
    assert_eq!(metrics.constructed(MachineRole::Storage), 1);
    assert_eq!(metrics.requests(MachineRole::Storage, RequestOutcome::Reused), 1);

    let worker = second.become_worker().await.unwrap();
    assert!(worker.worker.is_some());
    let status = second.status().await.unwrap();
    assert!(status.storage_assigned && status.worker_assigned);
    assert_eq!(status.pid, std::process::id());
    assert!(status
        .metrics
        .contains("blackrock_role_contexts_constructed_total{role=\"storage\"} 1"));
    assert!(status
        .metrics
        .contains("blackrock_role_requests_total{outcome=\"reused\",role=\"storage\"} 1"));
    assert!(status.metrics.contains("blackrock_roles_populated 2"));

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_agent_token_is_stale() {
    let dir = tempdir().unwrap();
    let agent = Arc::new(NodeRoleAgent::new(
        Arc::new(FilesystemStorageEngine::new(dir.path().join("storage"))),
        Arc::new(LocalWorkerHost::new(dir.path().join("worker"))),
    ));
    let transport = ReconnectableTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let token = transport.token();
    transport
        .serve(MachineService::new(agent), async {})
        .await
        .unwrap();

    let err = MachineConnection::dial(token, DIAL_TIMEOUT).await.unwrap_err();
    assert!(matches!(
        err,
        blackrock_cluster_rpc::RpcError::StaleToken { .. }
    ));
}
