//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::fs;
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use blackrock_cluster_rpc::{lookup_with_port, AddressToken};
use blackrock_common::LogSinkSpec;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{NodeError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_NAME_LEN: usize = 16;

/// A reachable log collector and the name this node announces to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSinkTarget {
    address: SocketAddr,
    name: String,
}

impl LogSinkTarget {
    /// Resolve `--log <addr>/<name>` and check the collector answers.
    ///
    /// Without a name the host name is used.
    pub fn resolve(spec: &LogSinkSpec) -> Result<Self> {
        let address = lookup_with_port(&spec.address)?;
        let probe = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).map_err(|source| {
            NodeError::LogSink {
                address: spec.address.clone(),
                source,
            }
        })?;
        drop(probe);
        let name = match &spec.name {
            Some(name) => name.clone(),
            None => nix::unistd::gethostname()
                .map(|host| host.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "slave".to_owned()),
        };
        Ok(Self::new(address, &name))
    }

    /// Target at `address`; `name` is sanitised.
    pub fn new(address: SocketAddr, name: &str) -> Self {
        Self {
            address,
            name: sanitize_name(name),
        }
    }

    /// Resolved collector address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Sanitised stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write the collector address to `path` through a temp file and rename.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&AddressToken::new(self.address).encode())?;
        staged.as_file().sync_data()?;
        staged.persist(path).map_err(|err| err.error)?;
        info!(path = %path.display(), address = %self.address, "log sink address recorded");
        Ok(())
    }

    /// Read the collector address recorded at `path`.
    pub fn load(path: &Path, name: &str) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let token = AddressToken::decode(&bytes)?;
        Ok(Some(Self::new(token.socket_addr(), name)))
    }

    /// Open a stream to the collector and announce this node's name.
    pub fn connect(&self) -> Result<TcpStream> {
        let sink_err = |source| NodeError::LogSink {
            address: self.address.to_string(),
            source,
        };
        let mut stream = TcpStream::connect_timeout(&self.address, CONNECT_TIMEOUT).map_err(sink_err)?;
        stream
            .write_all(format!("{}\n", self.name).as_bytes())
            .map_err(sink_err)?;
        debug!(address = %self.address, name = %self.name, "connected to log sink");
        Ok(stream)
    }
}

/// Collectors accept 1-16 characters from `[A-Za-z0-9_-]`.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .take(MAX_NAME_LEN)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "slave".to_owned()
    } else {
        cleaned
    }
}
