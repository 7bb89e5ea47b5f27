use async_trait::async_trait;
use std::{path::PathBuf, time::SystemTime};
use tokio::sync::Mutex;

use crate::{
    Image, Instance, InstanceStore, InstanceUpdate, Status, StoreError, Volume, VolumeStore,
    collides, find_instance,
};

#[derive(Debug, Default)]
struct Records {
    instances: Vec<Instance>,
    images: Vec<Image>,
    volumes: Vec<Volume>,
    transitions: Vec<(String, Status)>,
    deletes: usize,
}

/// A non-persistent store that also remembers what was done to it.
#[derive(Debug)]
pub struct MemoryStore {
    records: Mutex<Records>,
    volumes_dir: PathBuf,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_instances(Vec::new())
    }

    pub fn with_instances(instances: impl IntoIterator<Item = Instance>) -> Self {
        Self {
            records: Mutex::new(Records {
                instances: instances.into_iter().collect(),
                ..Records::default()
            }),
            volumes_dir: PathBuf::from("volumes"),
        }
    }

    pub async fn add_image(&self, image: Image) {
        self.records.lock().await.images.push(image);
    }

    pub async fn add_volume(&self, volume: Volume) {
        self.records.lock().await.volumes.push(volume);
    }

    /// Every status written through [`InstanceStore::update`], in order, keyed by name.
    pub async fn transitions(&self) -> Vec<(String, Status)> {
        self.records.lock().await.transitions.clone()
    }

    pub async fn delete_count(&self) -> usize {
        self.records.lock().await.deletes
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert(&self, instance: Instance) -> Result<Instance, StoreError> {
        let mut records = self.records.lock().await;
        if collides(&records.instances, &instance) {
            return Err(StoreError::Duplicate {
                name: instance.name,
            });
        }
        records.instances.push(instance.clone());
        Ok(instance)
    }

    async fn update(
        &self,
        key: &str,
        update: InstanceUpdate,
    ) -> Result<Option<Instance>, StoreError> {
        let mut records = self.records.lock().await;
        let Some(index) = find_instance(&records.instances, key) else {
            return Ok(None);
        };
        let instance = &mut records.instances[index];
        update.apply(instance);
        let instance = instance.clone();
        records
            .transitions
            .push((instance.name.clone(), instance.status));
        Ok(Some(instance))
    }

    async fn query(&self, key: &str) -> Result<Option<Instance>, StoreError> {
        let records = self.records.lock().await;
        Ok(find_instance(&records.instances, key).map(|index| records.instances[index].clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        records.deletes += 1;
        let Some(index) = find_instance(&records.instances, key) else {
            return Ok(false);
        };
        records.instances.remove(index);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Instance>, StoreError> {
        Ok(self.records.lock().await.instances.clone())
    }
}

#[async_trait]
impl VolumeStore for MemoryStore {
    async fn get_volume(&self, key: &str) -> Result<Option<Volume>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.volumes.iter().find(|volume| volume.matches(key)).cloned())
    }

    async fn get_image(&self, key: &str) -> Result<Option<Image>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.images.iter().find(|image| image.matches(key)).cloned())
    }

    async fn create_volume(
        &self,
        name: &str,
        image: &Image,
        size: Option<&str>,
    ) -> Result<Volume, StoreError> {
        let mut records = self.records.lock().await;
        if records.volumes.iter().any(|volume| volume.name == name) {
            return Err(StoreError::Duplicate {
                name: name.to_owned(),
            });
        }
        let volume = Volume {
            id: cuid2::create_id(),
            name: name.to_owned(),
            base_image_id: image.id.clone(),
            path: self.volumes_dir.join(format!("{name}.qcow2")),
            size: size.map(ToOwned::to_owned),
            created_at: SystemTime::now(),
        };
        records.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn insert_image(&self, image: Image) -> Result<Image, StoreError> {
        let mut records = self.records.lock().await;
        if records.images.iter().any(|other| other.name == image.name) {
            return Err(StoreError::Duplicate { name: image.name });
        }
        records.images.push(image.clone());
        Ok(image)
    }

    async fn list_images(&self) -> Result<Vec<Image>, StoreError> {
        Ok(self.records.lock().await.images.clone())
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, StoreError> {
        Ok(self.records.lock().await.volumes.clone())
    }
}
