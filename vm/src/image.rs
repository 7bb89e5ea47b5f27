use dfly_cmd::{Command, CommandError};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DriveImageError {
    #[error("missing required parameters: image, disk format or size")]
    MissingParameters,

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Creates a blank drive image with `qemu-img` unless one is already there.
pub async fn create_drive_image_if_needed(
    qemu_img: &str,
    path: Option<&Path>,
    format: Option<&str>,
    size: Option<&str>,
) -> Result<(), DriveImageError> {
    let (Some(path), Some(format), Some(size)) = (path, format, size) else {
        return Err(DriveImageError::MissingParameters);
    };

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        info!("Drive image {path:?} already exists, skipping creation");
        return Ok(());
    }

    Command::new(qemu_img)
        .args(["create", "-f", format])
        .arg(path)
        .arg(size)
        .run()
        .await?;

    info!("Created drive image at {path:?}");
    Ok(())
}
