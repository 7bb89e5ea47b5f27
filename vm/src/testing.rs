use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Notify;

use crate::{
    launch::{AttachedProcess, LaunchError, Launcher, ProcessExit},
    qemu::QemuInvocation,
    signal::{SignalKind, Signaller},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Launch {
    pub invocation: QemuInvocation,
    /// Set for detached launches.
    pub log_file: Option<PathBuf>,
}

/// Records launches instead of spawning anything.
#[derive(Debug)]
pub(crate) struct SpyLauncher {
    pid: u32,
    detached_pid: u32,
    gate: Option<Arc<Notify>>,
    exit_code: Option<i32>,
    early_exit: Option<Option<i32>>,
    launches: Mutex<Vec<Launch>>,
}

impl SpyLauncher {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            detached_pid: pid,
            gate: None,
            exit_code: Some(0),
            early_exit: None,
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Attached processes exit with this code.
    pub fn exits_with(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Detached processes get this pid instead.
    pub fn detaches_as(mut self, pid: u32) -> Self {
        self.detached_pid = pid;
        self
    }

    /// Attached processes only exit once `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Detached processes die during the settle delay.
    pub fn dies_early(mut self, code: Option<i32>) -> Self {
        self.early_exit = Some(code);
        self
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }
}

struct SpyProcess {
    pid: u32,
    exit: ProcessExit,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl AttachedProcess for SpyProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<ProcessExit, LaunchError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.exit)
    }
}

#[async_trait]
impl Launcher for SpyLauncher {
    async fn spawn_attached(
        &self,
        invocation: &QemuInvocation,
    ) -> Result<Box<dyn AttachedProcess>, LaunchError> {
        self.launches.lock().unwrap().push(Launch {
            invocation: invocation.clone(),
            log_file: None,
        });
        Ok(Box::new(SpyProcess {
            pid: self.pid,
            exit: ProcessExit {
                code: self.exit_code,
            },
            gate: self.gate.clone(),
        }))
    }

    async fn spawn_detached(
        &self,
        invocation: &QemuInvocation,
        log_file: &Path,
        _settle: Duration,
    ) -> Result<u32, LaunchError> {
        self.launches.lock().unwrap().push(Launch {
            invocation: invocation.clone(),
            log_file: Some(log_file.to_owned()),
        });
        match self.early_exit {
            Some(code) => Err(LaunchError::Exited { code }),
            None => Ok(self.detached_pid),
        }
    }
}

/// A single pretend process that reacts to signals as scripted.
#[derive(Debug)]
pub(crate) struct ScriptedSignaller {
    term_delivers: bool,
    kill_delivers: bool,
    dies_on_term: bool,
    alive: Mutex<bool>,
    sent: Mutex<Vec<(u32, SignalKind, bool)>>,
}

impl ScriptedSignaller {
    /// Alive, ignores SIGTERM, dies on SIGKILL.
    pub fn new() -> Self {
        Self {
            term_delivers: true,
            kill_delivers: true,
            dies_on_term: false,
            alive: Mutex::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn dies_on_term(mut self) -> Self {
        self.dies_on_term = true;
        self
    }

    pub fn term_fails(mut self) -> Self {
        self.term_delivers = false;
        self
    }

    pub fn kill_fails(mut self) -> Self {
        self.kill_delivers = false;
        self
    }

    pub fn dead(self) -> Self {
        *self.alive.lock().unwrap() = false;
        self
    }

    pub fn sent(&self) -> Vec<(u32, SignalKind, bool)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signaller for ScriptedSignaller {
    async fn send(&self, pid: u32, kind: SignalKind, elevated: bool) -> bool {
        self.sent.lock().unwrap().push((pid, kind, elevated));
        let mut alive = self.alive.lock().unwrap();
        match kind {
            SignalKind::Terminate if self.term_delivers => {
                if self.dies_on_term {
                    *alive = false;
                }
                true
            }
            SignalKind::Kill if self.kill_delivers => {
                *alive = false;
                true
            }
            _ => false,
        }
    }

    async fn is_alive(&self, _pid: u32) -> bool {
        *self.alive.lock().unwrap()
    }
}
