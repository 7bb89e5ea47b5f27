use async_trait::async_trait;
use dfly_cmd::CommandError;
use displaydoc::Display;
use std::{io, path::PathBuf};
use thiserror::Error;

mod json;
mod memory;
mod model;
mod time;

pub use json::JsonStore;
pub use memory::MemoryStore;
pub use model::{DEFAULT_VERSION, Image, Instance, InstanceUpdate, PidChange, Status, Volume};

/// Durable instance records, looked up by id or name.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert(&self, instance: Instance) -> Result<Instance, StoreError>;

    /// Applies a status transition. Returns `None` when no record matches `key`.
    async fn update(
        &self,
        key: &str,
        update: InstanceUpdate,
    ) -> Result<Option<Instance>, StoreError>;

    async fn query(&self, key: &str) -> Result<Option<Instance>, StoreError>;

    /// Returns whether a record was deleted.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<Instance>, StoreError>;
}

#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn get_volume(&self, key: &str) -> Result<Option<Volume>, StoreError>;

    async fn get_image(&self, key: &str) -> Result<Option<Image>, StoreError>;

    /// Creates a copy-on-write overlay of `image` and records it.
    async fn create_volume(
        &self,
        name: &str,
        image: &Image,
        size: Option<&str>,
    ) -> Result<Volume, StoreError>;

    async fn insert_image(&self, image: Image) -> Result<Image, StoreError>;

    async fn list_images(&self) -> Result<Vec<Image>, StoreError>;

    async fn list_volumes(&self) -> Result<Vec<Volume>, StoreError>;
}

#[derive(Debug, Error, Display)]
pub enum StoreError {
    /// Failed to read state file {path:?}
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Failed to write {path:?}
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Failed to parse state file {path:?}
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Failed to serialize state
    Serialize(#[source] serde_json::Error),
    /// Failed to acquire lock {path:?}
    Lock {
        path: PathBuf,
        #[source]
        source: dir_lock::Error,
    },
    /// Store task failed
    Join(#[from] tokio::task::JoinError),
    /// Name {name:?} is already taken
    Duplicate { name: String },
    /// Failed to create volume {name:?}
    Command {
        name: String,
        #[source]
        source: CommandError,
    },
}

/// Exact id matches win over name matches, so an id never resolves to another record.
pub(crate) fn find_instance(instances: &[Instance], key: &str) -> Option<usize> {
    instances
        .iter()
        .position(|instance| instance.id == key)
        .or_else(|| instances.iter().position(|instance| instance.name == key))
}

/// Names and ids share one lookup namespace, so a new record may not reuse either.
pub(crate) fn collides(instances: &[Instance], new: &Instance) -> bool {
    instances.iter().any(|instance| {
        instance.name == new.name
            || instance.id == new.name
            || instance.name == new.id
            || instance.id == new.id
    })
}
