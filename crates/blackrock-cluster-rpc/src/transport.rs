//! ---
//! br_section: "02-cluster-rpc"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Address tokens, reconnectable transport, and the machine protocol."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::time::Duration;

use blackrock_common::BindSpec;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tonic::transport::Server;
use tracing::{debug, info, warn};

use crate::address::{resolve_bind, AddressToken};
use crate::proto::machine_server::{Machine, MachineServer};
use crate::{Result, RpcError};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound listening endpoint that can be dialed again from its token alone.
///
/// Binding is synchronous and needs no runtime, so the listener can be
/// created before the process detaches and carried across `fork` intact.
#[derive(Debug)]
pub struct ReconnectableTransport {
    listener: StdTcpListener,
    token: AddressToken,
}

impl ReconnectableTransport {
    /// Bind to `requested`. Port `0` lets the OS choose.
    ///
    /// Wildcard hosts are refused: the token would name an address no
    /// remote peer can dial.
    pub fn bind(requested: SocketAddr) -> Result<Self> {
        if requested.ip().is_unspecified() {
            return Err(RpcError::Unroutable(requested));
        }
        let listener = StdTcpListener::bind(requested).map_err(|source| RpcError::Bind {
            address: requested,
            source,
        })?;
        let token = AddressToken::new(listener.local_addr()?);
        info!(%requested, %token, "transport bound");
        Ok(Self { listener, token })
    }

    /// Resolve a command-line bind specification and bind to it.
    pub fn bind_spec(spec: &BindSpec) -> Result<Self> {
        Self::bind(resolve_bind(spec)?)
    }

    /// Token describing how to reach this endpoint.
    pub fn token(&self) -> AddressToken {
        self.token
    }

    /// Hand the listener to the async runtime as a stream of accepted sockets.
    ///
    /// Must be called inside a tokio runtime. Accept failures are logged and
    /// retried, never surfaced as stream items, so the server keeps running.
    pub fn incoming(self) -> Result<BoxStream<'static, std::io::Result<TcpStream>>> {
        self.listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(self.listener)?;
        let token = self.token;
        let accepted = stream::unfold(listener, move |listener| async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%token, %peer, "accepted connection");
                        if let Err(err) = socket.set_nodelay(true) {
                            debug!(%peer, error = %err, "failed to set TCP_NODELAY");
                        }
                        return Some((Ok::<_, std::io::Error>(socket), listener));
                    }
                    Err(err) => {
                        warn!(%token, error = %err, "accept failed; retrying");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });
        Ok(accepted.boxed())
    }

    /// Serve the machine protocol until `shutdown` resolves.
    pub async fn serve<T, F>(self, service: T, shutdown: F) -> Result<()>
    where
        T: Machine,
        F: Future<Output = ()>,
    {
        let token = self.token;
        let incoming = self.incoming()?;
        info!(%token, "machine service listening");
        Server::builder()
            .add_service(MachineServer::new(service))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await?;
        info!(%token, "machine service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn wildcard_bind_is_refused() {
        let err = ReconnectableTransport::bind("0.0.0.0:0".parse().unwrap()).unwrap_err();
        assert!(matches!(err, RpcError::Unroutable(_)));
    }

    #[test]
    fn token_reports_chosen_port() {
        let transport = ReconnectableTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let token = transport.token();
        assert_ne!(token.port(), 0);
        assert!(token.ip().is_loopback());
    }

    #[test]
    fn bind_conflict_is_reported() {
        let first = ReconnectableTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = ReconnectableTransport::bind(first.token().socket_addr()).unwrap_err();
        assert!(matches!(err, RpcError::Bind { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn incoming_yields_connections_dialed_by_token() {
        let transport = ReconnectableTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let token = transport.token();
        let mut incoming = transport.incoming().unwrap();

        let dial = tokio::spawn(async move {
            let mut stream = TcpStream::connect(token.socket_addr()).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let mut accepted = incoming.next().await.unwrap().unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        dial.await.unwrap();
    }
}
