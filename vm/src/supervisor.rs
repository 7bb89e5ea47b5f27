use dfly_store::{Instance, InstanceStore, InstanceUpdate, Status, StoreError, VolumeStore};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    host::HostOs,
    image::{DriveImageError, create_drive_image_if_needed},
    launch::{LaunchError, Launcher, ProcessLauncher},
    lock::{InstanceLock, LockError},
    mac::mac_address_for,
    qemu::{ComposeOptions, QemuInvocation, StartOverrides, compose},
    signal::{ProcessSignaller, Signaller},
    terminate::{TerminateError, terminate},
    volume::{VolumeError, resolve_volume, with_volume},
};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("virtual machine with name or ID {key} not found")]
    NotFound { key: String },

    #[error("virtual machine {name} is already running")]
    AlreadyRunning { name: String },

    #[error("virtual machine {name} is not running")]
    NotRunning { name: String },

    #[error("cannot resolve {path:?}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Terminate(#[from] TerminateError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    DriveImage(#[from] DriveImageError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// How long a detached hypervisor must survive before it counts as started.
    pub launch_settle: Duration,
    /// Pause between stopping and starting again on restart.
    pub restart_settle: Duration,
    /// Time between SIGTERM and the liveness check.
    pub termination_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            launch_settle: Duration::from_secs(2),
            restart_settle: Duration::from_secs(2),
            termination_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub qemu_binary: String,
    pub qemu_img_binary: String,
    pub sudo_binary: String,
    pub logs_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub host_os: HostOs,
    pub timings: Timings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Share the terminal and block until the hypervisor exits.
    Attached,
    /// Run in the background with output in the instance log.
    Detached,
}

/// Everything needed to create a new instance and boot it.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub name: Option<String>,
    pub iso_path: Option<PathBuf>,
    pub cpu: String,
    pub cpus: u16,
    pub memory: String,
    pub drive_path: Option<PathBuf>,
    pub disk_format: String,
    pub disk_size: Option<String>,
    pub bridge: Option<String>,
    pub port_forward: Option<String>,
    pub version: String,
    /// Persist guest writes. Without it the hypervisor runs with `-snapshot`.
    pub install: bool,
    pub mode: StartMode,
}

/// Drives instances through their lifecycle against the record store.
///
/// Every operation re-reads the record before acting on it, and transitions of one
/// instance are serialized through an [`InstanceLock`].
pub struct Supervisor<S, L = ProcessLauncher, G = ProcessSignaller> {
    store: S,
    launcher: L,
    signaller: G,
    options: SupervisorOptions,
}

impl<S, L, G> Supervisor<S, L, G>
where
    S: InstanceStore + VolumeStore,
    L: Launcher,
    G: Signaller,
{
    pub fn new(store: S, launcher: L, signaller: G, options: SupervisorOptions) -> Self {
        Self {
            store,
            launcher,
            signaller,
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.options.logs_dir.join(format!("{name}.log"))
    }

    #[instrument(skip(self))]
    pub async fn start(
        &self,
        key: &str,
        overrides: &StartOverrides,
        mode: StartMode,
    ) -> Result<Instance, SupervisorError> {
        let instance = self.find(key).await?;
        ensure_startable(&instance)?;

        let lock = self.lock(&instance).await?;
        let instance = self.find(&instance.id).await?;
        ensure_startable(&instance)?;

        let overrides = match &overrides.volume {
            Some(volume) => {
                let volume = resolve_volume(&self.store, volume, &instance, overrides).await?;
                with_volume(overrides, &volume)
            }
            None => overrides.clone(),
        };

        let invocation = compose(&instance, &overrides, &self.compose_options(false, mode));
        self.update(&instance.id, InstanceUpdate::starting()).await?;

        info!("Starting {}", instance.name);
        self.launch(&instance, &invocation, mode, lock).await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, key: &str) -> Result<Instance, SupervisorError> {
        let instance = self.find(key).await?;
        let _lock = self.lock(&instance).await?;
        let instance = self.find(&instance.id).await?;
        self.stop_locked(&instance).await
    }

    /// Stops (when running), waits, then starts again in the background.
    #[instrument(skip(self))]
    pub async fn restart(&self, key: &str) -> Result<Instance, SupervisorError> {
        let instance = self.find(key).await?;

        let stopped = {
            let _lock = self.lock(&instance).await?;
            let instance = self.find(&instance.id).await?;
            match self.stop_locked(&instance).await {
                Ok(_) => true,
                Err(SupervisorError::NotRunning { .. }) => false,
                Err(error) => return Err(error),
            }
        };

        if stopped {
            tokio::time::sleep(self.options.timings.restart_settle).await;
        }

        self.start(&instance.id, &StartOverrides::default(), StartMode::Detached)
            .await
    }

    /// Deletes the record whatever its status. Stopping first is up to the caller.
    #[instrument(skip(self))]
    pub async fn remove(&self, key: &str) -> Result<Instance, SupervisorError> {
        let instance = self.find(key).await?;
        if !self.store.delete(&instance.id).await? {
            return Err(SupervisorError::NotFound {
                key: key.to_owned(),
            });
        }
        info!("Removed {}", instance.name);
        Ok(instance)
    }

    #[instrument(skip(self))]
    pub async fn inspect(&self, key: &str) -> Result<Instance, SupervisorError> {
        let instance = self.find(key).await?;
        self.reconcile(instance).await
    }

    /// Reconciled instances, only active ones unless `all`.
    pub async fn list(&self, all: bool) -> Result<Vec<Instance>, SupervisorError> {
        let mut instances = Vec::new();
        for instance in self.store.list().await? {
            let instance = self.reconcile(instance).await?;
            if all || instance.status.is_active() {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    /// Creates a new instance record and boots it.
    #[instrument(skip(self))]
    pub async fn run(&self, options: RunOptions) -> Result<Instance, SupervisorError> {
        if options.drive_path.is_some() && options.disk_size.is_some() {
            create_drive_image_if_needed(
                &self.options.qemu_img_binary,
                options.drive_path.as_deref(),
                Some(options.disk_format.as_str()),
                options.disk_size.as_deref(),
            )
            .await?;
        }

        let iso_path = canonicalize(options.iso_path.as_deref()).await?;
        let drive_path = canonicalize(options.drive_path.as_deref()).await?;

        let id = cuid2::create_id();
        let name = options.name.unwrap_or_else(generate_name);
        let mut instance = Instance::new(id.clone(), name, mac_address_for(&id));
        instance.status = Status::Starting;
        instance.cpu = options.cpu;
        instance.cpus = options.cpus;
        instance.memory = options.memory;
        instance.disk_format = options.disk_format;
        instance.disk_size = options.disk_size;
        instance.drive_path = drive_path;
        instance.iso_path = iso_path;
        instance.bridge = options.bridge;
        instance.port_forward = options.port_forward;
        instance.version = options.version;

        let instance = self.store.insert(instance).await?;
        let lock = self.lock(&instance).await?;

        let invocation = compose(
            &instance,
            &StartOverrides::default(),
            &self.compose_options(!options.install, options.mode),
        );

        info!("Created {} ({})", instance.name, instance.id);
        self.launch(&instance, &invocation, options.mode, lock)
            .await
    }

    /// Marks an active record `STOPPED` when its process is gone.
    pub async fn reconcile(&self, instance: Instance) -> Result<Instance, SupervisorError> {
        if !instance.status.is_active() || self.process_alive(instance.pid).await {
            return Ok(instance);
        }

        // A launch in progress holds the lock until its pid is recorded.
        let _lock = self.lock(&instance).await?;
        let current = self.find(&instance.id).await?;
        if !current.status.is_active() || self.process_alive(current.pid).await {
            return Ok(current);
        }

        warn!(
            "{} is {} but process {:?} is gone, marking STOPPED",
            current.name, current.status, current.pid
        );
        self.update(&current.id, InstanceUpdate::status(Status::Stopped))
            .await
    }

    async fn stop_locked(&self, instance: &Instance) -> Result<Instance, SupervisorError> {
        if instance.status == Status::Stopped {
            return Err(SupervisorError::NotRunning {
                name: instance.name.clone(),
            });
        }

        let Some(pid) = instance.pid else {
            // Nothing was ever spawned for this record.
            self.update(&instance.id, InstanceUpdate::status(Status::Stopped))
                .await?;
            return Err(SupervisorError::NotRunning {
                name: instance.name.clone(),
            });
        };

        let termination = terminate(
            &self.signaller,
            pid,
            instance.is_bridged(),
            self.options.timings.termination_grace,
        )
        .await?;

        info!("Stopped {} ({termination:?})", instance.name);
        self.update(&instance.id, InstanceUpdate::status(Status::Stopped))
            .await
    }

    /// Spawns the hypervisor for a record already marked `STARTING`.
    async fn launch(
        &self,
        instance: &Instance,
        invocation: &QemuInvocation,
        mode: StartMode,
        lock: InstanceLock,
    ) -> Result<Instance, SupervisorError> {
        debug!("{}: {invocation}", instance.name);

        match mode {
            StartMode::Detached => {
                let log_file = self.log_file(&instance.name);
                let launched = self
                    .launcher
                    .spawn_detached(invocation, &log_file, self.options.timings.launch_settle)
                    .await;
                let pid = match launched {
                    Ok(pid) => pid,
                    Err(error) => return Err(self.launch_failed(instance, error).await),
                };

                let running = self
                    .update(&instance.id, InstanceUpdate::with_pid(Status::Running, pid))
                    .await?;
                drop(lock);
                Ok(running)
            }
            StartMode::Attached => {
                let mut process = match self.launcher.spawn_attached(invocation).await {
                    Ok(process) => process,
                    Err(error) => return Err(self.launch_failed(instance, error).await),
                };

                let pid = process.pid();
                self.update(&instance.id, InstanceUpdate::with_pid(Status::Running, pid))
                    .await?;
                // Let other invocations stop the instance while it runs in the foreground.
                drop(lock);

                let exit = process.wait().await;
                let stopped = self.attached_exited(instance, pid).await?;

                let exit = exit?;
                if !exit.success() {
                    return Err(LaunchError::Exited { code: exit.code }.into());
                }
                Ok(stopped)
            }
        }
    }

    /// Marks the record `STOPPED` unless it now belongs to a newer process.
    async fn attached_exited(
        &self,
        instance: &Instance,
        pid: u32,
    ) -> Result<Instance, SupervisorError> {
        let _lock = self.lock(instance).await?;
        match self.store.query(&instance.id).await? {
            Some(current) if current.pid == Some(pid) => {
                self.update(&current.id, InstanceUpdate::status(Status::Stopped))
                    .await
            }
            Some(current) => {
                info!(
                    "{} exited but the record now tracks process {:?}, leaving it",
                    current.name, current.pid
                );
                Ok(current)
            }
            None => Ok(instance.clone()),
        }
    }

    async fn launch_failed(&self, instance: &Instance, error: LaunchError) -> SupervisorError {
        if let Err(store_error) = self
            .update(&instance.id, InstanceUpdate::status(Status::Stopped))
            .await
        {
            warn!("Failed to mark {} STOPPED: {store_error}", instance.name);
        }
        error.into()
    }

    async fn find(&self, key: &str) -> Result<Instance, SupervisorError> {
        self.store
            .query(key)
            .await?
            .ok_or_else(|| SupervisorError::NotFound {
                key: key.to_owned(),
            })
    }

    async fn update(
        &self,
        id: &str,
        update: InstanceUpdate,
    ) -> Result<Instance, SupervisorError> {
        self.store
            .update(id, update)
            .await?
            .ok_or_else(|| SupervisorError::NotFound { key: id.to_owned() })
    }

    async fn lock(&self, instance: &Instance) -> Result<InstanceLock, SupervisorError> {
        Ok(InstanceLock::acquire(&self.options.locks_dir, &instance.id).await?)
    }

    async fn process_alive(&self, pid: Option<u32>) -> bool {
        match pid {
            Some(pid) => self.signaller.is_alive(pid).await,
            None => false,
        }
    }

    fn compose_options(&self, snapshot: bool, mode: StartMode) -> ComposeOptions {
        ComposeOptions {
            qemu_binary: self.options.qemu_binary.clone(),
            sudo_binary: self.options.sudo_binary.clone(),
            host_os: self.options.host_os,
            snapshot,
            // A detached wrapper has no terminal to prompt on.
            non_interactive: mode == StartMode::Detached,
        }
    }
}

fn ensure_startable(instance: &Instance) -> Result<(), SupervisorError> {
    if instance.status.is_active() {
        return Err(SupervisorError::AlreadyRunning {
            name: instance.name.clone(),
        });
    }
    Ok(())
}

fn generate_name() -> String {
    let slug: String = cuid2::create_id().chars().take(8).collect();
    format!("vm-{slug}")
}

async fn canonicalize(path: Option<&Path>) -> Result<Option<PathBuf>, SupervisorError> {
    let Some(path) = path else {
        return Ok(None);
    };
    tokio::fs::canonicalize(path)
        .await
        .map(Some)
        .map_err(|source| SupervisorError::Canonicalize {
            path: path.to_owned(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signal::SignalKind,
        testing::{ScriptedSignaller, SpyLauncher},
    };
    use dfly_store::{Image, MemoryStore};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const PID: u32 = 4242;

    struct Harness {
        supervisor: Supervisor<MemoryStore, SpyLauncher, ScriptedSignaller>,
        dir: TempDir,
    }

    fn harness(
        instances: Vec<Instance>,
        launcher: SpyLauncher,
        signaller: ScriptedSignaller,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let options = SupervisorOptions {
            qemu_binary: "qemu-system-x86_64".to_owned(),
            qemu_img_binary: "qemu-img".to_owned(),
            sudo_binary: "sudo".to_owned(),
            logs_dir: dir.path().join("logs"),
            locks_dir: dir.path().join("locks"),
            host_os: HostOs::Linux,
            timings: Timings {
                launch_settle: Duration::ZERO,
                restart_settle: Duration::ZERO,
                termination_grace: Duration::ZERO,
            },
        };
        let supervisor = Supervisor::new(
            MemoryStore::with_instances(instances),
            launcher,
            signaller,
            options,
        );
        Harness { supervisor, dir }
    }

    fn stopped(name: &str) -> Instance {
        Instance::new(format!("id-{name}"), name, "52:54:00:00:00:01")
    }

    fn running(name: &str, pid: u32) -> Instance {
        let mut instance = stopped(name);
        instance.status = Status::Running;
        instance.pid = Some(pid);
        instance
    }

    fn run_options(mode: StartMode) -> RunOptions {
        RunOptions {
            name: None,
            iso_path: None,
            cpu: "host".to_owned(),
            cpus: 2,
            memory: "2G".to_owned(),
            drive_path: None,
            disk_format: "raw".to_owned(),
            disk_size: None,
            bridge: None,
            port_forward: None,
            version: "6.4.2".to_owned(),
            install: false,
            mode,
        }
    }

    async fn status_of(harness: &Harness, key: &str) -> Instance {
        harness
            .supervisor
            .store()
            .query(key)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn start_running_instance_conflicts() {
        for instance in [running("alpha", 7), {
            let mut starting = stopped("alpha");
            starting.status = Status::Starting;
            starting
        }] {
            let h = harness(vec![instance], SpyLauncher::new(PID), ScriptedSignaller::new());

            let err = h
                .supervisor
                .start("alpha", &StartOverrides::default(), StartMode::Detached)
                .await
                .unwrap_err();

            assert!(matches!(err, SupervisorError::AlreadyRunning { name } if name == "alpha"));
            assert!(h.supervisor.launcher.launches().is_empty());
            assert!(h.supervisor.store().transitions().await.is_empty());
        }
    }

    #[tokio::test]
    async fn start_missing_instance() {
        let h = harness(vec![], SpyLauncher::new(PID), ScriptedSignaller::new());

        let err = h
            .supervisor
            .start("ghost", &StartOverrides::default(), StartMode::Detached)
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::NotFound { key } if key == "ghost"));
        assert!(h.supervisor.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn detached_start_then_inspect() {
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );

        let started = h
            .supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Detached)
            .await
            .unwrap();
        assert_eq!(started.status, Status::Running);
        assert_eq!(started.pid, Some(PID));

        let inspected = h.supervisor.inspect("alpha").await.unwrap();
        assert_eq!(inspected.status, Status::Running);
        assert_eq!(inspected.pid, Some(PID));

        assert_eq!(
            h.supervisor.store().transitions().await,
            vec![
                ("alpha".to_owned(), Status::Starting),
                ("alpha".to_owned(), Status::Running),
            ]
        );

        let launches = h.supervisor.launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(
            launches[0].log_file,
            Some(h.dir.path().join("logs").join("alpha.log"))
        );
        assert!(!launches[0].invocation.args.iter().any(|arg| arg == "-snapshot"));
    }

    #[tokio::test]
    async fn attached_failure_marks_stopped_and_keeps_code() {
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(PID).exits_with(Some(3)),
            ScriptedSignaller::new(),
        );

        let err = h
            .supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Attached)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SupervisorError::Launch(LaunchError::Exited { code: Some(3) })
        ));
        let alpha = status_of(&h, "alpha").await;
        assert_eq!(alpha.status, Status::Stopped);
        assert_eq!(alpha.pid, Some(PID));
        assert_eq!(
            h.supervisor.store().transitions().await,
            vec![
                ("alpha".to_owned(), Status::Starting),
                ("alpha".to_owned(), Status::Running),
                ("alpha".to_owned(), Status::Stopped),
            ]
        );
        assert_eq!(h.supervisor.launcher.launches()[0].log_file, None);
    }

    #[tokio::test]
    async fn attached_clean_exit() {
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );

        let alpha = h
            .supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Attached)
            .await
            .unwrap();

        assert_eq!(alpha.status, Status::Stopped);
        assert_eq!(alpha.pid, Some(PID));
    }

    #[tokio::test]
    async fn attached_exit_leaves_newer_launch_alone() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(100).gated(gate.clone()).detaches_as(200),
            ScriptedSignaller::new().dies_on_term(),
        );

        let overrides = StartOverrides::default();
        let attached = h
            .supervisor
            .start("alpha", &overrides, StartMode::Attached);
        let restart = async {
            while status_of(&h, "alpha").await.status != Status::Running {
                tokio::task::yield_now().await;
            }
            let restarted = h.supervisor.restart("alpha").await.unwrap();
            gate.notify_one();
            restarted
        };
        let (attached, restarted) = tokio::join!(attached, restart);

        assert_eq!(restarted.pid, Some(200));
        let attached = attached.unwrap();
        assert_eq!(attached.status, Status::Running);
        assert_eq!(attached.pid, Some(200));

        let alpha = status_of(&h, "alpha").await;
        assert_eq!(alpha.status, Status::Running);
        assert_eq!(alpha.pid, Some(200));

        let err = h
            .supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Detached)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { .. }));
        assert_eq!(h.supervisor.launcher.launches().len(), 2);
    }

    #[tokio::test]
    async fn start_forgets_previous_pid() {
        let mut alpha = stopped("alpha");
        alpha.pid = Some(42);
        let h = harness(
            vec![alpha],
            SpyLauncher::new(PID).dies_early(Some(1)),
            ScriptedSignaller::new(),
        );

        h.supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Detached)
            .await
            .unwrap_err();

        assert_eq!(status_of(&h, "alpha").await.pid, None);
    }

    #[tokio::test]
    async fn abandoned_start_is_reconciled_despite_reused_pid() {
        let mut alpha = stopped("alpha");
        alpha.pid = Some(42);
        // Pid 42 now belongs to some unrelated live process.
        let h = harness(vec![alpha], SpyLauncher::new(PID), ScriptedSignaller::new());
        h.supervisor
            .store()
            .update("alpha", InstanceUpdate::starting())
            .await
            .unwrap();

        let alpha = h.supervisor.inspect("alpha").await.unwrap();
        assert_eq!(alpha.status, Status::Stopped);
        assert_eq!(alpha.pid, None);

        let err = h.supervisor.stop("alpha").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning { .. }));
        assert!(h.supervisor.signaller.sent().is_empty());

        h.supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Detached)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn only_detached_sudo_is_non_interactive() {
        let mut alpha = stopped("alpha");
        alpha.bridge = Some("br0".to_owned());
        let h = harness(vec![alpha], SpyLauncher::new(PID), ScriptedSignaller::new());

        h.supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Attached)
            .await
            .unwrap();
        h.supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Detached)
            .await
            .unwrap();

        let launches = h.supervisor.launcher.launches();
        assert_eq!(launches[0].invocation.program, "sudo");
        assert_eq!(launches[0].invocation.args[0], "qemu-system-x86_64");
        assert_eq!(launches[1].invocation.args[..2], ["-n", "qemu-system-x86_64"]);
    }

    #[tokio::test]
    async fn detached_early_exit_marks_stopped() {
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(PID).dies_early(Some(1)),
            ScriptedSignaller::new(),
        );

        let err = h
            .supervisor
            .start("alpha", &StartOverrides::default(), StartMode::Detached)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SupervisorError::Launch(LaunchError::Exited { code: Some(1) })
        ));
        assert_eq!(status_of(&h, "alpha").await.status, Status::Stopped);
        assert_eq!(
            h.supervisor.store().transitions().await,
            vec![
                ("alpha".to_owned(), Status::Starting),
                ("alpha".to_owned(), Status::Stopped),
            ]
        );
    }

    #[tokio::test]
    async fn stop_after_process_already_exited() {
        let h = harness(
            vec![running("alpha", 42)],
            SpyLauncher::new(PID),
            ScriptedSignaller::new().term_fails().dead(),
        );

        let alpha = h.supervisor.stop("alpha").await.unwrap();

        assert_eq!(alpha.status, Status::Stopped);
        assert_eq!(alpha.pid, Some(42));
        assert_eq!(
            h.supervisor.signaller.sent(),
            vec![(42, SignalKind::Terminate, false)]
        );
    }

    #[tokio::test]
    async fn stop_escalates_when_term_is_ignored() {
        let h = harness(
            vec![running("alpha", 42)],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );

        let alpha = h.supervisor.stop("alpha").await.unwrap();

        assert_eq!(alpha.status, Status::Stopped);
        assert_eq!(
            h.supervisor.signaller.sent(),
            vec![
                (42, SignalKind::Terminate, false),
                (42, SignalKind::Kill, false)
            ]
        );
    }

    #[tokio::test]
    async fn stop_escalates_when_term_is_undeliverable() {
        let h = harness(
            vec![running("alpha", 42)],
            SpyLauncher::new(PID),
            ScriptedSignaller::new().term_fails(),
        );

        let alpha = h.supervisor.stop("alpha").await.unwrap();

        assert_eq!(alpha.status, Status::Stopped);
        assert_eq!(h.supervisor.signaller.sent().len(), 2);
    }

    #[tokio::test]
    async fn stop_bridged_instance_is_elevated() {
        let mut alpha = running("alpha", 42);
        alpha.bridge = Some("br0".to_owned());
        let h = harness(
            vec![alpha],
            SpyLauncher::new(PID),
            ScriptedSignaller::new().dies_on_term(),
        );

        h.supervisor.stop("alpha").await.unwrap();

        assert_eq!(
            h.supervisor.signaller.sent(),
            vec![(42, SignalKind::Terminate, true)]
        );
    }

    #[tokio::test]
    async fn failed_termination_leaves_running() {
        let h = harness(
            vec![running("alpha", 42)],
            SpyLauncher::new(PID),
            ScriptedSignaller::new().kill_fails(),
        );

        let err = h.supervisor.stop("alpha").await.unwrap_err();

        assert!(matches!(
            err,
            SupervisorError::Terminate(TerminateError::Failed { pid: 42 })
        ));
        assert_eq!(status_of(&h, "alpha").await.status, Status::Running);
    }

    #[tokio::test]
    async fn stop_stopped_instance() {
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );

        let err = h.supervisor.stop("alpha").await.unwrap_err();

        assert!(matches!(err, SupervisorError::NotRunning { .. }));
        assert!(h.supervisor.signaller.sent().is_empty());
    }

    #[tokio::test]
    async fn stop_without_pid_clears_status() {
        let mut alpha = stopped("alpha");
        alpha.status = Status::Starting;
        let h = harness(vec![alpha], SpyLauncher::new(PID), ScriptedSignaller::new());

        let err = h.supervisor.stop("alpha").await.unwrap_err();

        assert!(matches!(err, SupervisorError::NotRunning { .. }));
        assert_eq!(status_of(&h, "alpha").await.status, Status::Stopped);
        assert!(h.supervisor.signaller.sent().is_empty());
    }

    #[tokio::test]
    async fn restart_aborts_when_termination_fails() {
        let h = harness(
            vec![running("alpha", 42)],
            SpyLauncher::new(PID),
            ScriptedSignaller::new().kill_fails(),
        );

        let err = h.supervisor.restart("alpha").await.unwrap_err();

        assert!(matches!(err, SupervisorError::Terminate(_)));
        assert!(h.supervisor.launcher.launches().is_empty());
        assert_eq!(status_of(&h, "alpha").await.status, Status::Running);
    }

    #[tokio::test]
    async fn restart_running_instance() {
        let h = harness(
            vec![running("alpha", 42)],
            SpyLauncher::new(PID),
            ScriptedSignaller::new().dies_on_term(),
        );

        let alpha = h.supervisor.restart("alpha").await.unwrap();

        assert_eq!(alpha.status, Status::Running);
        assert_eq!(alpha.pid, Some(PID));
        let launches = h.supervisor.launcher.launches();
        assert_eq!(launches.len(), 1);
        assert!(launches[0].log_file.is_some());
    }

    #[tokio::test]
    async fn restart_stopped_instance_just_starts() {
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );

        let alpha = h.supervisor.restart("id-alpha").await.unwrap();

        assert_eq!(alpha.status, Status::Running);
        assert!(h.supervisor.signaller.sent().is_empty());
        assert_eq!(h.supervisor.launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn remove_missing_instance() {
        let h = harness(vec![], SpyLauncher::new(PID), ScriptedSignaller::new());

        let err = h.supervisor.remove("alpha").await.unwrap_err();

        assert!(matches!(err, SupervisorError::NotFound { .. }));
        assert_eq!(h.supervisor.store().delete_count().await, 0);
    }

    #[tokio::test]
    async fn remove_ignores_status() {
        let h = harness(
            vec![running("alpha", 42)],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );

        let removed = h.supervisor.remove("alpha").await.unwrap();

        assert_eq!(removed.status, Status::Running);
        assert!(h.supervisor.store().query("alpha").await.unwrap().is_none());
        assert!(h.supervisor.signaller.sent().is_empty());
    }

    #[tokio::test]
    async fn inspect_downgrades_dead_process() {
        let h = harness(
            vec![running("alpha", 42)],
            SpyLauncher::new(PID),
            ScriptedSignaller::new().dead(),
        );

        let alpha = h.supervisor.inspect("alpha").await.unwrap();

        assert_eq!(alpha.status, Status::Stopped);
        assert_eq!(alpha.pid, Some(42));
    }

    #[tokio::test]
    async fn list_filters_inactive() {
        let h = harness(
            vec![running("alpha", 42), stopped("beta")],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );

        let active = h.supervisor.list(false).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "alpha");

        let all = h.supervisor.list(true).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn start_from_volume() {
        let mut alpha = stopped("alpha");
        alpha.drive_path = Some(PathBuf::from("/images/debian.qcow2"));
        let h = harness(vec![alpha], SpyLauncher::new(PID), ScriptedSignaller::new());
        h.supervisor
            .store()
            .add_image(Image::new("debian", "/images/debian.qcow2", "qcow2"))
            .await;

        let overrides = StartOverrides {
            volume: Some("data".to_owned()),
            ..StartOverrides::default()
        };
        h.supervisor
            .start("alpha", &overrides, StartMode::Detached)
            .await
            .unwrap();

        let launches = h.supervisor.launcher.launches();
        assert!(
            launches[0]
                .invocation
                .args
                .contains(&"file=volumes/data.qcow2,format=qcow2,if=virtio".to_owned())
        );
        assert_eq!(
            status_of(&h, "alpha").await.drive_path,
            Some(PathBuf::from("/images/debian.qcow2"))
        );
    }

    #[tokio::test]
    async fn unresolvable_volume_fails_before_spawn() {
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );

        let overrides = StartOverrides {
            volume: Some("data".to_owned()),
            ..StartOverrides::default()
        };
        let err = h
            .supervisor
            .start("alpha", &overrides, StartMode::Detached)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SupervisorError::Volume(VolumeError::NoDrivePath { .. })
        ));
        assert!(h.supervisor.launcher.launches().is_empty());
        assert!(h.supervisor.store().transitions().await.is_empty());
    }

    #[tokio::test]
    async fn run_creates_and_launches() {
        let h = harness(vec![], SpyLauncher::new(PID), ScriptedSignaller::new());
        let iso = h.dir.path().join("dfly.iso");
        std::fs::write(&iso, b"iso").unwrap();

        let mut options = run_options(StartMode::Detached);
        options.iso_path = Some(iso.clone());
        options.port_forward = Some("2222:22".to_owned());

        let instance = h.supervisor.run(options).await.unwrap();

        assert!(instance.name.starts_with("vm-"));
        assert_eq!(instance.status, Status::Running);
        assert_eq!(instance.pid, Some(PID));
        assert_eq!(instance.mac_address, mac_address_for(&instance.id));
        assert_eq!(instance.iso_path, Some(iso.canonicalize().unwrap()));

        let launches = h.supervisor.launcher.launches();
        assert_eq!(launches[0].invocation.args.last().map(String::as_str), Some("-snapshot"));
        assert_eq!(
            h.supervisor.store().transitions().await,
            vec![(instance.name.clone(), Status::Running)]
        );
    }

    #[tokio::test]
    async fn run_install_persists_writes() {
        let h = harness(vec![], SpyLauncher::new(PID), ScriptedSignaller::new());
        let mut options = run_options(StartMode::Attached);
        options.name = Some("alpha".to_owned());
        options.install = true;

        let alpha = h.supervisor.run(options).await.unwrap();

        assert_eq!(alpha.name, "alpha");
        assert_eq!(alpha.status, Status::Stopped);
        let launches = h.supervisor.launcher.launches();
        assert!(!launches[0].invocation.args.iter().any(|arg| arg == "-snapshot"));
    }

    #[tokio::test]
    async fn run_rejects_taken_name() {
        let h = harness(
            vec![stopped("alpha")],
            SpyLauncher::new(PID),
            ScriptedSignaller::new(),
        );
        let mut options = run_options(StartMode::Detached);
        options.name = Some("alpha".to_owned());

        let err = h.supervisor.run(options).await.unwrap_err();

        assert!(matches!(
            err,
            SupervisorError::Store(StoreError::Duplicate { .. })
        ));
        assert!(h.supervisor.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn run_with_missing_iso() {
        let h = harness(vec![], SpyLauncher::new(PID), ScriptedSignaller::new());
        let mut options = run_options(StartMode::Detached);
        options.iso_path = Some(h.dir.path().join("missing.iso"));

        let err = h.supervisor.run(options).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Canonicalize { .. }));
        assert!(h.supervisor.store().list().await.unwrap().is_empty());
    }
}
