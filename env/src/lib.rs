// Inspiration: https://github.com/cubic-vm/cubic/blob/68566f79d72e2037bce1b75246d92e6da7b999e5/src/env/environment_factory.rs

use std::{
    env::{self, VarError},
    path::{Path, PathBuf},
};

use thiserror::Error;

const PROJECT_NAME: &str = "dfly";

#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
    config_dir: PathBuf,
    runtime_dir: PathBuf,
}

#[derive(Error, Debug, Clone)]
pub enum PathsError {
    #[error("cannot locate {purpose} directory: {source}")]
    Var {
        purpose: &'static str,
        #[source]
        source: VarError,
    },
}

impl Paths {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
        runtime_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            config_dir: config_dir.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Everything under one root, for tests and throwaway setups.
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::new(root.join("data"), root.join("config"), root.join("run"))
    }

    #[cfg(target_os = "linux")]
    pub fn create() -> Result<Paths, PathsError> {
        let data_dir: PathBuf = Self::var("data", "XDG_DATA_HOME")
            .or_else(|_| Self::var("data", "HOME").map(|home| format!("{home}/.local/share")))
            .map(From::from)?;

        let config_dir: PathBuf = Self::var("config", "XDG_CONFIG_HOME")
            .or_else(|_| Self::var("config", "HOME").map(|home| format!("{home}/.config")))
            .map(From::from)?;

        let runtime_dir: PathBuf = Self::var("runtime", "XDG_RUNTIME_DIR")
            .or_else(|_| Self::var("runtime", "UID").map(|uid| format!("/run/user/{uid}")))
            .or_else(|_| Ok::<_, PathsError>(env::temp_dir().to_string_lossy().into_owned()))
            .map(From::from)?;

        Ok(Paths::new(
            data_dir.join(PROJECT_NAME),
            config_dir.join(PROJECT_NAME),
            runtime_dir.join(PROJECT_NAME),
        ))
    }

    #[cfg(target_os = "macos")]
    pub fn create() -> Result<Paths, PathsError> {
        let home_dir: PathBuf = Self::var("home", "HOME").map(From::from)?;

        Ok(Paths::new(
            home_dir
                .join("Library")
                .join("Application Support")
                .join(PROJECT_NAME),
            home_dir.join("Library").join("Preferences").join(PROJECT_NAME),
            home_dir.join("Library").join("Caches").join(PROJECT_NAME),
        ))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn create() -> Result<Paths, PathsError> {
        let home_dir: PathBuf = Self::var("home", "HOME").map(From::from)?;
        let root = home_dir.join(format!(".{PROJECT_NAME}"));
        Ok(Paths::new(root.join("data"), root.clone(), root.join("run")))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("dfly.toml")
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn state_lock_dir(&self) -> PathBuf {
        self.data_dir.join("state.lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    /// Per-instance transition locks live here, one directory per instance id.
    pub fn locks_dir(&self) -> PathBuf {
        self.runtime_dir.join("locks")
    }

    fn var(purpose: &'static str, var: &str) -> Result<String, PathsError> {
        env::var(var).map_err(|source| PathsError::Var { purpose, source })
    }
}
