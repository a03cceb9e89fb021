//! ---
//! br_section: "02-cluster-rpc"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Address tokens, reconnectable transport, and the machine protocol."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::fmt;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

use blackrock_common::{AddressFamily, BindSpec};
use bytes::{Buf, BufMut, BytesMut};
use nix::ifaddrs::getifaddrs;
use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// Size in bytes of an encoded [`AddressToken`].
pub const TOKEN_LEN: usize = 20;

const TOKEN_VERSION: u8 = 1;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// How to dial a listening node: address family, host bytes, and port.
///
/// Encoded as a fixed 20-byte record:
///
/// | offset | size | field                                        |
/// |--------|------|----------------------------------------------|
/// | 0      | 1    | family (`4` or `6`)                          |
/// | 1      | 1    | record version (`1`)                         |
/// | 2      | 2    | port, big endian                             |
/// | 4      | 16   | host; IPv4 uses the first 4 bytes, rest zero |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressToken {
    addr: SocketAddr,
}

impl AddressToken {
    /// Build a token for the given socket address.
    pub fn new(addr: SocketAddr) -> Self {
        // Flow info and scope are not part of the record.
        let addr = match addr {
            SocketAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(*v6.ip(), v6.port(), 0, 0)),
            v4 => v4,
        };
        Self { addr }
    }

    /// Address family of the host.
    pub fn family(&self) -> AddressFamily {
        match self.addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Host part of the token.
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Port part of the token.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The token as a socket address suitable for dialing.
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serialize into the fixed-size record.
    pub fn encode(&self) -> [u8; TOKEN_LEN] {
        let mut buf = BytesMut::with_capacity(TOKEN_LEN);
        match self.addr {
            SocketAddr::V4(v4) => {
                buf.put_u8(FAMILY_V4);
                buf.put_u8(TOKEN_VERSION);
                buf.put_u16(v4.port());
                buf.put_slice(&v4.ip().octets());
                buf.put_bytes(0, 12);
            }
            SocketAddr::V6(v6) => {
                buf.put_u8(FAMILY_V6);
                buf.put_u8(TOKEN_VERSION);
                buf.put_u16(v6.port());
                buf.put_slice(&v6.ip().octets());
            }
        }
        let mut record = [0u8; TOKEN_LEN];
        record.copy_from_slice(&buf);
        record
    }

    /// Parse a record produced by [`AddressToken::encode`].
    ///
    /// The slice must be exactly [`TOKEN_LEN`] bytes; a shorter slice is a
    /// partially written record and is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != TOKEN_LEN {
            return Err(RpcError::MalformedToken(format!(
                "expected {} bytes, found {}",
                TOKEN_LEN,
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let family = buf.get_u8();
        let version = buf.get_u8();
        if version != TOKEN_VERSION {
            return Err(RpcError::MalformedToken(format!(
                "unsupported record version {version}"
            )));
        }
        let port = buf.get_u16();
        let mut host = [0u8; 16];
        buf.copy_to_slice(&mut host);
        let addr = match family {
            FAMILY_V4 => {
                if host[4..].iter().any(|b| *b != 0) {
                    return Err(RpcError::MalformedToken(
                        "non-zero padding after IPv4 host".to_owned(),
                    ));
                }
                let ip = Ipv4Addr::new(host[0], host[1], host[2], host[3]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            }
            FAMILY_V6 => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(host), port, 0, 0)),
            other => {
                return Err(RpcError::MalformedToken(format!(
                    "unknown address family {other}"
                )))
            }
        };
        Ok(Self { addr })
    }

    /// Read exactly one record from `reader`.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::with_capacity(TOKEN_LEN);
        reader.read_to_end(&mut bytes)?;
        Self::decode(&bytes)
    }
}

impl From<SocketAddr> for AddressToken {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for AddressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// Resolve a command-line bind specification to a concrete listening address.
///
/// Literal hosts without a port get port `0`, letting the OS choose.
pub fn resolve_bind(spec: &BindSpec) -> Result<SocketAddr> {
    match spec {
        BindSpec::Literal(host) => resolve_literal(host),
        BindSpec::Interface { family, name } => {
            interface_address(*family, name).map(|ip| SocketAddr::new(ip, 0))
        }
    }
}

fn resolve_literal(host: &str) -> Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 0));
    }
    let has_port = host
        .rsplit_once(':')
        .map_or(false, |(name, port)| !name.is_empty() && port.parse::<u16>().is_ok());
    let resolved = if has_port {
        host.to_socket_addrs()
    } else {
        (host, 0u16).to_socket_addrs()
    };
    resolved
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| RpcError::MalformedAddress(host.to_owned()))
}

/// Resolve `host:port`, requiring an explicit port.
pub fn lookup_with_port(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| RpcError::MalformedAddress(address.to_owned()))
}

fn interface_address(family: AddressFamily, name: &str) -> Result<IpAddr> {
    for ifaddr in getifaddrs()? {
        if ifaddr.interface_name != name {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        match family {
            AddressFamily::Ipv4 => {
                if let Some(sin) = storage.as_sockaddr_in() {
                    return Ok(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
                }
            }
            AddressFamily::Ipv6 => {
                if let Some(sin6) = storage.as_sockaddr_in6() {
                    return Ok(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
                }
            }
        }
    }
    Err(RpcError::InterfaceNotFound {
        family,
        name: name.to_owned(),
    })
}
