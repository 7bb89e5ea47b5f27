use async_trait::async_trait;
use dfly_cmd::{Command, Io};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use std::fmt::Display;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Terminate,
    Kill,
}

impl SignalKind {
    fn signal(self) -> Signal {
        match self {
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        }
    }

    /// Flag understood by `kill(1)`.
    fn kill_flag(self) -> &'static str {
        match self {
            SignalKind::Terminate => "-TERM",
            SignalKind::Kill => "-KILL",
        }
    }
}

impl Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Signal delivery and liveness probing for hypervisor processes.
#[async_trait]
pub trait Signaller: Send + Sync {
    /// Returns whether the signal was delivered.
    async fn send(&self, pid: u32, kind: SignalKind, elevated: bool) -> bool;

    async fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Clone)]
pub struct ProcessSignaller {
    sudo: String,
}

impl ProcessSignaller {
    pub fn new(sudo: impl Into<String>) -> Self {
        Self { sudo: sudo.into() }
    }
}

impl Default for ProcessSignaller {
    fn default() -> Self {
        Self::new("sudo")
    }
}

/// Pids 0 and below address process groups, never a single process.
fn target(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

#[async_trait]
impl Signaller for ProcessSignaller {
    async fn send(&self, pid: u32, kind: SignalKind, elevated: bool) -> bool {
        let Some(target) = target(pid) else {
            return false;
        };

        if elevated {
            let mut command = Command::new("kill");
            command.args([kind.kill_flag(), pid.to_string().as_str()]);
            let mut command = command.sudo(&self.sudo);
            command.io(Io::Quiet);
            return match command.status().await {
                Ok(status) => status.success(),
                Err(error) => {
                    debug!("{kind} to {pid} failed: {error}");
                    false
                }
            };
        }

        match kill(target, kind.signal()) {
            Ok(()) => true,
            Err(errno) => {
                debug!("{kind} to {pid} failed: {errno}");
                false
            }
        }
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let Some(target) = target(pid) else {
            return false;
        };
        // EPERM means the process exists but belongs to someone else (e.g. root under sudo).
        matches!(kill(target, None), Ok(()) | Err(Errno::EPERM))
    }
}
