//! ---
//! br_section: "04-master"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Fleet master: launches node agents and assigns their roles."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use blackrock_cluster_rpc::proto::{BecomeStorageResponse, BecomeWorkerResponse};
use blackrock_cluster_rpc::{AddressToken, MachineConnection};
use blackrock_common::{FleetConfig, MachineRole};
use futures::future::try_join_all;
use tracing::info;

use crate::driver::ComputeDriver;
use crate::{MasterError, Result};

/// A launched machine the master holds a connection to.
#[derive(Debug)]
pub struct MachineHandle {
    /// Machine name from the fleet configuration.
    pub name: String,
    /// Token the agent reported.
    pub token: AddressToken,
    /// Live connection to the agent.
    pub connection: MachineConnection,
}

/// The assembled fleet.
#[derive(Debug)]
pub struct Fleet {
    /// The storage machine.
    pub storage: MachineHandle,
    /// Capabilities returned by the storage role.
    pub storage_caps: BecomeStorageResponse,
    /// Worker machines and their worker capability, in configuration order.
    pub workers: Vec<(MachineHandle, BecomeWorkerResponse)>,
}

impl Fleet {
    /// Number of machines in the fleet.
    pub fn len(&self) -> usize {
        1 + self.workers.len()
    }

    /// A fleet always has its storage machine.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Launch every machine, dial it, and assign its configured role.
///
/// Launches run concurrently. Roles are assigned storage first. Calling this
/// again against running agents returns the same capabilities.
pub async fn assign_roles(
    config: &FleetConfig,
    driver: &dyn ComputeDriver,
    restart: bool,
) -> Result<Fleet> {
    config
        .validate()
        .map_err(|err| MasterError::Config(format!("{err:#}")))?;

    let launches = config.machines.iter().map(|(name, machine)| async move {
        let token = driver.launch(name, machine, restart).await?;
        let connection = MachineConnection::dial(token, config.connect_timeout)
            .await
            .map_err(|source| MasterError::Rpc {
                machine: name.clone(),
                source,
            })?;
        Ok::<_, MasterError>((
            machine.role,
            MachineHandle {
                name: name.clone(),
                token,
                connection,
            },
        ))
    });
    let launched = try_join_all(launches).await?;

    let mut storage = None;
    let mut workers = Vec::new();
    for (role, handle) in launched {
        match role {
            MachineRole::Storage => storage = Some(handle),
            MachineRole::Worker => workers.push(handle),
        }
    }
    let Some(mut storage) = storage else {
        return Err(MasterError::Config("no storage machine configured".into()));
    };

    let storage_caps = storage
        .connection
        .become_storage()
        .await
        .map_err(|source| MasterError::Rpc {
            machine: storage.name.clone(),
            source,
        })?;
    info!(machine = %storage.name, token = %storage.token, "storage role assigned");

    let mut assigned = Vec::with_capacity(workers.len());
    for mut worker in workers {
        let caps = worker
            .connection
            .become_worker()
            .await
            .map_err(|source| MasterError::Rpc {
                machine: worker.name.clone(),
                source,
            })?;
        info!(machine = %worker.name, token = %worker.token, "worker role assigned");
        assigned.push((worker, caps));
    }

    Ok(Fleet {
        storage,
        storage_caps,
        workers: assigned,
    })
}
