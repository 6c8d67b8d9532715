//! Read-only object store used by the input resolver.
//!
//! A container holds named objects. Listing is always in ascending name
//! order so that resolving the same container twice yields the same
//! offsets.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use walkdir::WalkDir;

use crate::error::{MrError, Result};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("object {name} not found in container {container}")]
    ObjectNotFound { container: String, name: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether a later attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Names of every object in `container`, sorted ascending.
    async fn list(&self, container: &str) -> std::result::Result<Vec<String>, StoreError>;

    async fn get(&self, container: &str, name: &str) -> std::result::Result<Vec<u8>, StoreError>;
}

/// Containers are directories below `root`; objects are the files inside
/// them, named by their `/`-separated relative path.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsObjectStore { root: root.into() }
    }

    /// Accepts `file://<root>` or a bare directory path.
    pub fn from_connection_string(conn: &str) -> Result<Self> {
        let conn = conn.trim();
        let root = match conn.split_once("://") {
            Some(("file", path)) => path,
            Some((scheme, _)) => {
                return Err(MrError::Configuration(format!(
                    "unsupported object store scheme `{}`",
                    scheme
                )))
            }
            None if conn.contains(';') => {
                return Err(MrError::Configuration(
                    "unsupported object store connection string".to_string(),
                ))
            }
            None => conn,
        };
        if root.is_empty() {
            return Err(MrError::Configuration(
                "object store root is empty".to_string(),
            ));
        }
        Ok(FsObjectStore::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> std::result::Result<PathBuf, StoreError> {
        let dir = self.root.join(container);
        if container.is_empty() || container.contains("..") || !dir.is_dir() {
            return Err(StoreError::ContainerNotFound(container.to_string()));
        }
        Ok(dir)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, container: &str) -> std::result::Result<Vec<String>, StoreError> {
        let dir = self.container_dir(container)?;
        tokio::task::spawn_blocking(move || {
            let mut names = vec![];
            for entry in WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&dir) {
                    let name: Vec<_> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    names.push(name.join("/"));
                }
            }
            names.sort();
            Ok::<_, StoreError>(names)
        })
        .await
        .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    async fn get(&self, container: &str, name: &str) -> std::result::Result<Vec<u8>, StoreError> {
        let dir = self.container_dir(container)?;
        let not_found = || StoreError::ObjectNotFound {
            container: container.to_string(),
            name: name.to_string(),
        };
        if name.is_empty() || name.split('/').any(|part| part == "..") {
            return Err(not_found());
        }
        match tokio::fs::read(dir.join(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// In-memory containers, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    containers: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_container(&self, container: &str) {
        if let Ok(mut containers) = self.containers.write() {
            containers.entry(container.to_string()).or_default();
        }
    }

    pub fn put(&self, container: &str, name: &str, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut containers) = self.containers.write() {
            containers
                .entry(container.to_string())
                .or_default()
                .insert(name.to_string(), bytes.into());
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Io(io::Error::new(io::ErrorKind::Other, "store lock poisoned"))
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, container: &str) -> std::result::Result<Vec<String>, StoreError> {
        let containers = self.containers.read().map_err(|_| poisoned())?;
        containers
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))
    }

    async fn get(&self, container: &str, name: &str) -> std::result::Result<Vec<u8>, StoreError> {
        let containers = self.containers.read().map_err(|_| poisoned())?;
        let objects = containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::ObjectNotFound {
                container: container.to_string(),
                name: name.to_string(),
            })
    }
}
