use dfly_env::Paths;
use dfly_vm::Timings;
use serde::Deserialize;
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::fs::read_to_string;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found at: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub qemu: String,
    pub qemu_img: String,
    pub sudo: String,
    pub logs_dir: Option<PathBuf>,
    pub defaults: Defaults,
    pub timings: TimingsConfig,
}

/// Hardware used by `run` when no flag says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    pub cpu: String,
    pub cpus: u16,
    pub memory: String,
    pub disk_format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingsConfig {
    pub launch_settle_ms: u64,
    pub restart_settle_ms: u64,
    pub termination_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            qemu: "qemu-system-x86_64".to_owned(),
            qemu_img: "qemu-img".to_owned(),
            sudo: "sudo".to_owned(),
            logs_dir: None,
            defaults: Defaults::default(),
            timings: TimingsConfig::default(),
        }
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            cpu: "host".to_owned(),
            cpus: 2,
            memory: "2G".to_owned(),
            disk_format: "raw".to_owned(),
        }
    }
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            launch_settle_ms: 2000,
            restart_settle_ms: 2000,
            termination_grace_ms: 3000,
        }
    }
}

impl TimingsConfig {
    pub fn timings(&self) -> Timings {
        Timings {
            launch_settle: Duration::from_millis(self.launch_settle_ms),
            restart_settle: Duration::from_millis(self.restart_settle_ms),
            termination_grace: Duration::from_millis(self.termination_grace_ms),
        }
    }
}

impl Config {
    /// Loads `explicit` if given (it must exist), else the default config file if present.
    pub async fn load(explicit: Option<&Path>, paths: &Paths) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_owned()));
                }
                path.to_owned()
            }
            None => {
                let path = paths.config_file();
                if !path.exists() {
                    debug!("No config at {path:?}, using defaults");
                    return Ok(Config::default());
                }
                path
            }
        };

        let string = read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        Self::parse(&path, &string)
    }

    pub fn parse(path: &Path, string: &str) -> Result<Self, ConfigError> {
        toml::from_str(string).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn logs_dir(&self, paths: &Paths) -> PathBuf {
        self.logs_dir.clone().unwrap_or_else(|| paths.logs_dir())
    }
}
