use dfly_store::{Image, Instance, StoreError, Volume, VolumeStore};
use thiserror::Error;
use tracing::{debug, info};

use crate::qemu::StartOverrides;

/// Format of every volume overlay.
pub const VOLUME_FORMAT: &str = "qcow2";

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("no drivePath defined for instance {name}")]
    NoDrivePath { name: String },

    #[error("image not found: {key}")]
    ImageNotFound { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Finds the named volume, or creates it from the instance's base image.
///
/// The base image is looked up from the override drive path, then the instance's
/// own drive path, and finally the image behind a volume of that name.
pub async fn resolve_volume<V: VolumeStore + ?Sized>(
    volumes: &V,
    name: &str,
    instance: &Instance,
    overrides: &StartOverrides,
) -> Result<Volume, VolumeError> {
    if let Some(volume) = volumes.get_volume(name).await? {
        debug!("Using existing volume {name} at {:?}", volume.path);
        return Ok(volume);
    }

    let image = base_image(volumes, instance, overrides).await?;
    let size = overrides
        .disk_size
        .as_deref()
        .or(instance.disk_size.as_deref());

    let volume = volumes.create_volume(name, &image, size).await?;
    info!("Created volume {name} from image {}", image.name);
    Ok(volume)
}

async fn base_image<V: VolumeStore + ?Sized>(
    volumes: &V,
    instance: &Instance,
    overrides: &StartOverrides,
) -> Result<Image, VolumeError> {
    if let Some(drive_path) = &overrides.drive_path {
        if let Some(image) = volumes.get_image(&drive_path.to_string_lossy()).await? {
            return Ok(image);
        }
    }

    let Some(drive_path) = &instance.drive_path else {
        return match &overrides.drive_path {
            Some(drive_path) => Err(VolumeError::ImageNotFound {
                key: drive_path.to_string_lossy().into_owned(),
            }),
            None => Err(VolumeError::NoDrivePath {
                name: instance.name.clone(),
            }),
        };
    };
    let key = drive_path.to_string_lossy();

    if let Some(image) = volumes.get_image(&key).await? {
        return Ok(image);
    }

    if let Some(volume) = volumes.get_volume(&key).await? {
        if let Some(image) = volumes.get_image(&volume.base_image_id).await? {
            return Ok(image);
        }
    }

    Err(VolumeError::ImageNotFound {
        key: key.into_owned(),
    })
}

/// Boots this invocation from `volume` instead of the instance's own drive.
pub fn with_volume(overrides: &StartOverrides, volume: &Volume) -> StartOverrides {
    StartOverrides {
        drive_path: Some(volume.path.clone()),
        disk_format: Some(VOLUME_FORMAT.to_owned()),
        ..overrides.clone()
    }
}
