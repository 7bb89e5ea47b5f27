use async_trait::async_trait;
use dfly_cmd::{CommandError, Io};
use std::{
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};
use thiserror::Error;
use tokio::process::Child;
use tracing::{debug, info};

use crate::qemu::QemuInvocation;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to launch hypervisor: {0}")]
    Spawn(#[from] CommandError),

    #[error("hypervisor exited with {}", describe_exit(.code))]
    Exited { code: Option<i32> },

    #[error("pid unavailable, process exited immediately?")]
    PidUnavailable,

    #[error("failed to open log file {path:?}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for hypervisor")]
    Wait(#[source] io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_owned(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A hypervisor running in the foreground of this process.
#[async_trait]
pub trait AttachedProcess: Send {
    fn pid(&self) -> u32;

    async fn wait(&mut self) -> Result<ProcessExit, LaunchError>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawns with the terminal's stdio. The caller waits on the returned handle.
    async fn spawn_attached(
        &self,
        invocation: &QemuInvocation,
    ) -> Result<Box<dyn AttachedProcess>, LaunchError>;

    /// Spawns in the background with output appended to `log_file`, then waits
    /// `settle` for an early exit before handing back the pid.
    async fn spawn_detached(
        &self,
        invocation: &QemuInvocation,
        log_file: &Path,
        settle: Duration,
    ) -> Result<u32, LaunchError>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

#[derive(Debug)]
struct ChildProcess {
    child: Child,
    pid: u32,
}

#[async_trait]
impl AttachedProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<ProcessExit, LaunchError> {
        let status = self.child.wait().await.map_err(LaunchError::Wait)?;
        Ok(status.into())
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn spawn_attached(
        &self,
        invocation: &QemuInvocation,
    ) -> Result<Box<dyn AttachedProcess>, LaunchError> {
        let mut command = invocation.command();
        command.io(Io::Inherit);

        let child = command.spawn()?;
        let pid = child.id().ok_or(LaunchError::PidUnavailable)?;
        info!("Started hypervisor {pid} in the foreground");

        Ok(Box::new(ChildProcess { child, pid }))
    }

    async fn spawn_detached(
        &self,
        invocation: &QemuInvocation,
        log_file: &Path,
        settle: Duration,
    ) -> Result<u32, LaunchError> {
        let log_error = |source| LaunchError::LogFile {
            path: log_file.to_owned(),
            source,
        };

        if let Some(logs_dir) = log_file.parent() {
            tokio::fs::create_dir_all(logs_dir)
                .await
                .map_err(log_error)?;
        }
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .await
            .map_err(log_error)?
            .into_std()
            .await;

        let mut command = invocation.command();
        command.io(Io::Log(log)).detach();

        let mut child = command.spawn()?;
        let pid = child.id().ok_or(LaunchError::PidUnavailable)?;
        debug!("Spawned hypervisor {pid}, settling for {settle:?}");

        tokio::time::sleep(settle).await;

        if let Some(status) = child.try_wait().map_err(LaunchError::Wait)? {
            return Err(LaunchError::Exited {
                code: status.code(),
            });
        }

        info!("Started hypervisor {pid} in the background, logging to {log_file:?}");
        Ok(pid)
    }
}
