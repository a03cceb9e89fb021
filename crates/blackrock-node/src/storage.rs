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

/// Interface name of the storage root-set capability.
pub const STORAGE_ROOT_SET_INTERFACE: &str = "blackrock.StorageRootSet";
/// Interface name of the storage factory capability.
pub const STORAGE_FACTORY_INTERFACE: &str = "blackrock.StorageFactory";
/// Marker file written the first time a storage root is set up.
pub const SETUP_MARKER: &str = ".blackrock-storage";

/// Builds the storage role context. Called at most once per agent process.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Prepare the storage engine and return its context.
    async fn open(&self) -> anyhow::Result<StorageContext>;
}

/// Live storage role: the prepared root and the capabilities handed to callers.
#[derive(Debug)]
pub struct StorageContext {
    id: Uuid,
    created_at: DateTime<Utc>,
    root: PathBuf,
    root_set: CapabilityRef,
    storage_factory: CapabilityRef,
}

impl StorageContext {
    /// Mint a context over a prepared `root`.
    pub fn new(root: PathBuf) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            created_at: Utc::now(),
            root,
            root_set: CapabilityRef::mint(STORAGE_ROOT_SET_INTERFACE, id),
            storage_factory: CapabilityRef::mint(STORAGE_FACTORY_INTERFACE, id),
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

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Capability for the root set of grains.
    pub fn root_set(&self) -> &CapabilityRef {
        &self.root_set
    }

    /// Capability for creating new storage objects.
    pub fn storage_factory(&self) -> &CapabilityRef {
        &self.storage_factory
    }
}

/// Storage engine rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemStorageEngine {
    root: PathBuf,
}

impl FilesystemStorageEngine {
    /// Engine storing everything under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageEngine for FilesystemStorageEngine {
    async fn open(&self) -> anyhow::Result<StorageContext> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create storage root {}", self.root.display()))?;
        let context = StorageContext::new(self.root.clone());
        let marker = self.root.join(SETUP_MARKER);
        let initialised = tokio::fs::try_exists(&marker)
            .await
            .with_context(|| format!("failed to check {}", marker.display()))?;
        if initialised {
            info!(root = %self.root.display(), context = %context.id(), "reusing storage root");
        } else {
            let body = format!("context={}\ncreated_at={}\n", context.id(), context.created_at().to_rfc3339());
            tokio::fs::write(&marker, body)
                .await
                .with_context(|| format!("failed to write {}", marker.display()))?;
            info!(root = %self.root.display(), context = %context.id(), "storage root initialised");
        }
        Ok(context)
    }
}
