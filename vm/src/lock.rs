use dir_lock::DirLock;
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("failed to create locks directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock {path:?}")]
    Lock {
        path: PathBuf,
        #[source]
        source: dir_lock::Error,
    },

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Advisory lock held across one state transition of one instance.
///
/// Released on drop.
pub struct InstanceLock {
    _lock: DirLock,
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock").finish_non_exhaustive()
    }
}

impl InstanceLock {
    pub async fn acquire(locks_dir: &Path, instance_id: &str) -> Result<Self, LockError> {
        tokio::fs::create_dir_all(locks_dir)
            .await
            .map_err(|source| LockError::CreateDir {
                path: locks_dir.to_owned(),
                source,
            })?;

        let lock_dir = locks_dir.join(format!("{instance_id}.lock"));
        trace!("Trying to lock {lock_dir:?}");

        let lock = tokio::task::spawn_blocking(move || {
            DirLock::new_sync(&lock_dir).map_err(|source| LockError::Lock {
                path: lock_dir.clone(),
                source,
            })
        })
        .await??;

        Ok(Self { _lock: lock })
    }
}
