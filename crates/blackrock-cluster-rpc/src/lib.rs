//! ---
//! br_section: "02-cluster-rpc"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Address tokens, reconnectable transport, and the machine protocol."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! Registry-free RPC plumbing between the master and node agents.
//!
//! A node binds a [`ReconnectableTransport`], derives an [`AddressToken`]
//! from the bound socket, and publishes that token. Anyone holding the token
//! can dial the node again with [`MachineConnection::dial`]; nothing else is
//! needed to find it. The token carries no identity or credentials.
#![warn(missing_docs)]

use std::net::SocketAddr;

use blackrock_common::AddressFamily;

pub mod address;
pub mod client;
pub mod transport;

#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("blackrock.machine");
}

/// Shared result type for cluster RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors raised by address handling, the transport, and the dialing client.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The requested listening address could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address that was requested.
        address: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The address string could not be resolved.
    #[error("malformed address '{0}'")]
    MalformedAddress(String),
    /// The named interface has no address of the requested family.
    #[error("no {family} address on interface '{name}'")]
    InterfaceNotFound {
        /// Requested family.
        family: AddressFamily,
        /// Interface name.
        name: String,
    },
    /// Enumerating local interfaces failed.
    #[error("interface enumeration failed: {0}")]
    InterfaceLookup(#[from] nix::errno::Errno),
    /// A wildcard address would produce a token nobody can dial.
    #[error("address {0} is not dialable; bind to a concrete host address")]
    Unroutable(SocketAddr),
    /// Bytes that do not form a valid token record.
    #[error("malformed address token: {0}")]
    MalformedToken(String),
    /// Dialing a token failed. The agent it names is most likely gone.
    #[error("agent at {token} is unreachable (stale token?): {source}")]
    StaleToken {
        /// Token that was dialed.
        token: address::AddressToken,
        /// Connection failure.
        #[source]
        source: tonic::transport::Error,
    },
    /// Transport level failure from the RPC server.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    /// The remote end answered with an error status.
    #[error("rpc failed: {0}")]
    Status(#[from] tonic::Status),
    /// Wrapper for IO errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use address::{lookup_with_port, resolve_bind, AddressToken, TOKEN_LEN};
pub use client::{MachineClient, MachineConnection};
pub use transport::ReconnectableTransport;
