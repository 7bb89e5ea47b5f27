use async_trait::async_trait;
use dfly_cmd::Command;
use dfly_env::Paths;
use dir_lock::DirLock;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, trace};

use crate::{
    Image, Instance, InstanceStore, InstanceUpdate, StoreError, Volume, VolumeStore,
    collides, find_instance,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    instances: Vec<Instance>,
    #[serde(default)]
    images: Vec<Image>,
    #[serde(default)]
    volumes: Vec<Volume>,
}

/// Records kept in a single JSON document.
///
/// Every mutation holds a directory lock next to the document for the whole
/// read-modify-write, and replaces the document by renaming a temp file over it.
/// Readers never take the lock.
#[derive(Debug, Clone)]
pub struct JsonStore {
    state_file: PathBuf,
    lock_dir: PathBuf,
    volumes_dir: PathBuf,
    qemu_img: String,
}

impl JsonStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            state_file: paths.state_file(),
            lock_dir: paths.state_lock_dir(),
            volumes_dir: paths.volumes_dir(),
            qemu_img: "qemu-img".to_owned(),
        }
    }

    pub fn with_qemu_img(mut self, qemu_img: impl Into<String>) -> Self {
        self.qemu_img = qemu_img.into();
        self
    }

    async fn load(&self) -> Result<State, StoreError> {
        let state_file = self.state_file.clone();
        tokio::task::spawn_blocking(move || read_state(&state_file)).await?
    }

    async fn transact<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut State) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let state_file = self.state_file.clone();
        let lock_dir = self.lock_dir.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = lock_dir.parent() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                    path: parent.to_owned(),
                    source,
                })?;
            }

            trace!("Trying to lock {lock_dir:?}");
            let lock = DirLock::new_sync(&lock_dir).map_err(|source| StoreError::Lock {
                path: lock_dir.clone(),
                source,
            })?;

            let mut state = read_state(&state_file)?;
            let value = change(&mut state)?;
            write_state(&state_file, &state)?;

            drop(lock);
            Ok(value)
        })
        .await?
    }
}

fn read_state(path: &Path) -> Result<State, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(State::default()),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_owned(),
                source,
            });
        }
    };

    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.to_owned(),
        source,
    })
}

fn write_state(path: &Path, state: &State) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(state).map_err(StoreError::Serialize)?;
    let tmp_path = path.with_extension("json.tmp");

    let write_error = |source| StoreError::Write {
        path: path.to_owned(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::write(&tmp_path, json).map_err(write_error)?;
    fs::rename(&tmp_path, path).map_err(write_error)?;

    Ok(())
}

#[async_trait]
impl InstanceStore for JsonStore {
    async fn insert(&self, instance: Instance) -> Result<Instance, StoreError> {
        self.transact(move |state| {
            if collides(&state.instances, &instance) {
                return Err(StoreError::Duplicate {
                    name: instance.name,
                });
            }
            state.instances.push(instance.clone());
            Ok(instance)
        })
        .await
    }

    async fn update(
        &self,
        key: &str,
        update: InstanceUpdate,
    ) -> Result<Option<Instance>, StoreError> {
        let key = key.to_owned();
        self.transact(move |state| {
            let Some(index) = find_instance(&state.instances, &key) else {
                return Ok(None);
            };
            let instance = &mut state.instances[index];
            update.apply(instance);
            Ok(Some(instance.clone()))
        })
        .await
    }

    async fn query(&self, key: &str) -> Result<Option<Instance>, StoreError> {
        let mut state = self.load().await?;
        Ok(find_instance(&state.instances, key).map(|index| state.instances.swap_remove(index)))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_owned();
        self.transact(move |state| {
            let Some(index) = find_instance(&state.instances, &key) else {
                return Ok(false);
            };
            state.instances.remove(index);
            Ok(true)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Instance>, StoreError> {
        Ok(self.load().await?.instances)
    }
}

#[async_trait]
impl VolumeStore for JsonStore {
    async fn get_volume(&self, key: &str) -> Result<Option<Volume>, StoreError> {
        let state = self.load().await?;
        Ok(state.volumes.into_iter().find(|volume| volume.matches(key)))
    }

    async fn get_image(&self, key: &str) -> Result<Option<Image>, StoreError> {
        let state = self.load().await?;
        Ok(state.images.into_iter().find(|image| image.matches(key)))
    }

    async fn create_volume(
        &self,
        name: &str,
        image: &Image,
        size: Option<&str>,
    ) -> Result<Volume, StoreError> {
        if self.get_volume(name).await?.is_some() {
            return Err(StoreError::Duplicate {
                name: name.to_owned(),
            });
        }

        tokio::fs::create_dir_all(&self.volumes_dir)
            .await
            .map_err(|source| StoreError::Write {
                path: self.volumes_dir.clone(),
                source,
            })?;

        let path = self.volumes_dir.join(format!("{name}.qcow2"));

        let mut command = Command::new(&self.qemu_img);
        command
            .args(["create", "-f", "qcow2", "-F", image.format.as_str(), "-b"])
            .arg(&image.path)
            .arg(&path);
        if let Some(size) = size {
            command.arg(size);
        }
        debug!("Creating volume {name}: {command}");
        command.run().await.map_err(|source| StoreError::Command {
            name: name.to_owned(),
            source,
        })?;

        let volume = Volume {
            id: cuid2::create_id(),
            name: name.to_owned(),
            base_image_id: image.id.clone(),
            path,
            size: size.map(ToOwned::to_owned),
            created_at: SystemTime::now(),
        };

        self.transact(move |state| {
            if state.volumes.iter().any(|other| other.name == volume.name) {
                return Err(StoreError::Duplicate { name: volume.name });
            }
            state.volumes.push(volume.clone());
            Ok(volume)
        })
        .await
    }

    async fn insert_image(&self, image: Image) -> Result<Image, StoreError> {
        self.transact(move |state| {
            if state.images.iter().any(|other| other.name == image.name) {
                return Err(StoreError::Duplicate { name: image.name });
            }
            state.images.push(image.clone());
            Ok(image)
        })
        .await
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        Ok(self.load().await?.images)
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, StoreError> {
        Ok(self.load().await?.volumes)
    }
}
