//! ---
//! br_section: "02-cluster-rpc"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Address tokens, reconnectable transport, and the machine protocol."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument};

use crate::address::AddressToken;
use crate::proto::machine_client;
use crate::proto::{
    BecomeStorageRequest, BecomeStorageResponse, BecomeWorkerRequest, BecomeWorkerResponse,
    StatusRequest, StatusResponse,
};
use crate::{Result, RpcError};

/// Generated machine client over a tonic channel.
pub type MachineClient = machine_client::MachineClient<Channel>;

/// A live connection to a node agent, established from its token.
#[derive(Debug, Clone)]
pub struct MachineConnection {
    token: AddressToken,
    client: MachineClient,
}

impl MachineConnection {
    /// Dial the agent named by `token`.
    ///
    /// A refused or timed-out connection is reported as
    /// [`RpcError::StaleToken`]: whoever published the token is gone.
    #[instrument(skip_all, fields(%token))]
    pub async fn dial(token: AddressToken, timeout: Duration) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", token.socket_addr()))?
            .connect_timeout(timeout)
            .tcp_nodelay(true);
        let channel = endpoint
            .connect()
            .await
            .map_err(|source| RpcError::StaleToken { token, source })?;
        debug!("connected to agent");
        Ok(Self {
            token,
            client: MachineClient::new(channel),
        })
    }

    /// Token this connection was dialed from.
    pub fn token(&self) -> AddressToken {
        self.token
    }

    /// Ask the agent for its storage capabilities.
    pub async fn become_storage(&mut self) -> Result<BecomeStorageResponse> {
        let response = self
            .client
            .become_storage(BecomeStorageRequest {})
            .await?;
        Ok(response.into_inner())
    }

    /// Ask the agent for its worker capability.
    pub async fn become_worker(&mut self) -> Result<BecomeWorkerResponse> {
        let response = self.client.become_worker(BecomeWorkerRequest {}).await?;
        Ok(response.into_inner())
    }

    /// Fetch the agent's process and role summary.
    pub async fn status(&mut self) -> Result<StatusResponse> {
        let response = self.client.status(StatusRequest {}).await?;
        Ok(response.into_inner())
    }

    /// Direct access to the generated client.
    pub fn client(&mut self) -> &mut MachineClient {
        &mut self.client
    }
}
