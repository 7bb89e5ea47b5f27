use clap::{Args, Parser, Subcommand};
use dfly_cmd::{Command as Cmd, CommandError, Io};
use dfly_env::{Paths, PathsError};
use dfly_store::{DEFAULT_VERSION, Image, JsonStore, StoreError, VolumeStore};
use dfly_vm::{
    HostOs, LaunchError, ProcessLauncher, ProcessSignaller, RunOptions, StartMode,
    StartOverrides, Supervisor, SupervisorError, SupervisorOptions,
};
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};
use thiserror::Error;
use tracing::debug;

mod config;
mod view;

pub use config::{Config, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "dfly", version, about = "Run and supervise QEMU virtual machines")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to dfly.toml
    #[arg(long = "config", global = true, env = "DFLY_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `dfly_vm=trace`
    #[arg(long = "log", global = true, default_value = "info")]
    pub log: String,
}

/// Hardware flags shared by `run` and `start`.
#[derive(Args, Debug, Clone, Default)]
pub struct HardwareArgs {
    #[arg(long)]
    pub cpus: Option<u16>,

    #[arg(long)]
    pub memory: Option<String>,

    /// CPU model passed to `-cpu`
    #[arg(long)]
    pub cpu: Option<String>,

    /// Drive image
    #[arg(long)]
    pub image: Option<PathBuf>,

    #[arg(long = "disk-format")]
    pub disk_format: Option<String>,

    /// Drive size, e.g. 20G
    #[arg(long)]
    pub size: Option<String>,

    /// Attach to this host bridge instead of user networking
    #[arg(long)]
    pub bridge: Option<String>,

    /// Comma-separated host:guest TCP pairs
    #[arg(long = "port-forward")]
    pub port_forward: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new virtual machine and boot it
    Run {
        /// ISO path or release version (default 6.4.2)
        iso: Option<String>,

        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        hardware: HardwareArgs,

        /// Persist writes to the drive instead of running with -snapshot
        #[arg(long)]
        install: bool,

        #[arg(long, short = 'd')]
        detach: bool,
    },
    /// Start a stopped virtual machine
    Start {
        name: String,

        #[command(flatten)]
        hardware: HardwareArgs,

        /// Boot from this volume, creating it from the base image when missing
        #[arg(long)]
        volume: Option<String>,

        #[arg(long, short = 'd')]
        detach: bool,
    },
    /// Stop a running virtual machine
    Stop { name: String },
    /// Stop (if running) and start again in the background
    Restart { name: String },
    /// Delete a virtual machine record
    Rm { name: String },
    /// Print a virtual machine record as JSON
    Inspect { name: String },
    /// List virtual machines
    Ps {
        /// Include stopped ones
        #[arg(long, short = 'a')]
        all: bool,
    },
    /// Print the log of a detached virtual machine
    Logs {
        name: String,

        #[arg(long, short = 'f')]
        follow: bool,
    },
    /// Manage base images
    #[command(subcommand)]
    Image(ImageCommand),
    /// Manage volumes
    #[command(subcommand)]
    Volume(VolumeCommand),
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// Register a local image
    Add {
        name: String,
        path: PathBuf,

        #[arg(long, default_value = "qcow2")]
        format: String,
    },
    /// List images
    Ls,
}

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    /// List volumes
    Ls,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Paths(#[from] PathsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{name} not found on PATH: {source}")]
    MissingExecutable {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("cannot resolve image path {path:?}: {source}")]
    ImagePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create logs directory {path:?}: {source}")]
    LogsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize instance: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// The hypervisor's own code for attached failures, otherwise 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Supervisor(SupervisorError::Launch(LaunchError::Exited {
                code: Some(code),
            })) if *code != 0 => *code,
            _ => 1,
        }
    }
}

type Dfly = Supervisor<JsonStore, ProcessLauncher, ProcessSignaller>;

pub async fn run(cli: Cli) -> Result<(), AppError> {
    let Cli {
        command,
        config_path,
        log: _,
    } = cli;

    let paths = Paths::create()?;
    let config = Config::load(config_path.as_deref(), &paths).await?;
    let supervisor = supervisor(&paths, &config);

    match command {
        Command::Run {
            iso,
            name,
            hardware,
            install,
            detach,
        } => {
            require(&config.qemu)?;
            let (iso_path, version) = iso_and_version(iso.as_deref());
            let defaults = &config.defaults;
            let options = RunOptions {
                name,
                iso_path: Some(iso_path),
                cpu: hardware.cpu.unwrap_or_else(|| defaults.cpu.clone()),
                cpus: hardware.cpus.unwrap_or(defaults.cpus),
                memory: hardware.memory.unwrap_or_else(|| defaults.memory.clone()),
                disk_size: hardware.size,
                drive_path: hardware.image,
                disk_format: hardware
                    .disk_format
                    .unwrap_or_else(|| defaults.disk_format.clone()),
                bridge: hardware.bridge,
                port_forward: hardware.port_forward,
                version,
                install,
                mode: mode(detach),
            };
            let instance = supervisor.run(options).await?;
            report_started(&supervisor, &instance, detach);
        }
        Command::Start {
            name,
            hardware,
            volume,
            detach,
        } => {
            require(&config.qemu)?;
            let overrides = StartOverrides {
                memory: hardware.memory,
                cpus: hardware.cpus,
                cpu: hardware.cpu,
                disk_format: hardware.disk_format,
                port_forward: hardware.port_forward,
                drive_path: hardware.image,
                bridge: hardware.bridge,
                disk_size: hardware.size,
                volume,
            };
            let instance = supervisor.start(&name, &overrides, mode(detach)).await?;
            report_started(&supervisor, &instance, detach);
        }
        Command::Stop { name } => {
            let instance = supervisor.stop(&name).await?;
            println!("{} stopped.", instance.name);
        }
        Command::Restart { name } => {
            require(&config.qemu)?;
            let instance = supervisor.restart(&name).await?;
            report_started(&supervisor, &instance, true);
        }
        Command::Rm { name } => {
            let instance = supervisor.remove(&name).await?;
            println!("{} removed.", instance.name);
        }
        Command::Inspect { name } => {
            let instance = supervisor.inspect(&name).await?;
            println!("{}", serde_json::to_string_pretty(&instance)?);
        }
        Command::Ps { all } => {
            let instances = supervisor.list(all).await?;
            println!("{}", view::instances_table(&instances, SystemTime::now()));
        }
        Command::Logs { name, follow } => {
            logs(&supervisor, &name, follow).await?;
        }
        Command::Image(ImageCommand::Add { name, path, format }) => {
            let path = tokio::fs::canonicalize(&path)
                .await
                .map_err(|source| AppError::ImagePath { path, source })?;
            let image = supervisor
                .store()
                .insert_image(Image::new(name, path, format))
                .await?;
            println!("Image {} added.", image.name);
        }
        Command::Image(ImageCommand::Ls) => {
            let images = supervisor.store().list_images().await?;
            println!("{}", view::images_table(&images, SystemTime::now()));
        }
        Command::Volume(VolumeCommand::Ls) => {
            let store = supervisor.store();
            let volumes = store.list_volumes().await?;
            let images = store.list_images().await?;
            println!(
                "{}",
                view::volumes_table(&volumes, &images, SystemTime::now())
            );
        }
    }

    Ok(())
}

fn supervisor(paths: &Paths, config: &Config) -> Dfly {
    let store = JsonStore::new(paths).with_qemu_img(config.qemu_img.clone());
    let options = SupervisorOptions {
        qemu_binary: config.qemu.clone(),
        qemu_img_binary: config.qemu_img.clone(),
        sudo_binary: config.sudo.clone(),
        logs_dir: config.logs_dir(paths),
        locks_dir: paths.locks_dir(),
        host_os: HostOs::current(),
        timings: config.timings.timings(),
    };
    Supervisor::new(
        store,
        ProcessLauncher,
        ProcessSignaller::new(config.sudo.clone()),
        options,
    )
}

fn require(program: &str) -> Result<PathBuf, AppError> {
    let path = which::which(program).map_err(|source| AppError::MissingExecutable {
        name: program.to_owned(),
        source,
    })?;
    debug!("Using {program} at {path:?}");
    Ok(path)
}

fn mode(detach: bool) -> StartMode {
    if detach {
        StartMode::Detached
    } else {
        StartMode::Attached
    }
}

fn report_started(supervisor: &Dfly, instance: &dfly_store::Instance, detached: bool) {
    if !detached {
        return;
    }
    if let Some(pid) = instance.pid {
        println!("{} started with PID {pid}.", instance.name);
    }
    println!(
        "Logs are being written to {}",
        supervisor.log_file(&instance.name).display()
    );
}

/// Release ISO for a version string, or the given path as is.
fn iso_and_version(input: Option<&str>) -> (PathBuf, String) {
    match input {
        Some(input) if !is_version(input) => (PathBuf::from(input), DEFAULT_VERSION.to_owned()),
        input => {
            let version = input.unwrap_or(DEFAULT_VERSION);
            (release_iso(version), version.to_owned())
        }
    }
}

fn is_version(input: &str) -> bool {
    let parts: Vec<&str> = input.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

fn release_iso(version: &str) -> PathBuf {
    PathBuf::from(format!("dfly-x86_64-{version}_REL.iso"))
}

async fn logs(supervisor: &Dfly, name: &str, follow: bool) -> Result<(), AppError> {
    let logs_dir = &supervisor.options().logs_dir;
    tokio::fs::create_dir_all(logs_dir)
        .await
        .map_err(|source| AppError::LogsDir {
            path: logs_dir.clone(),
            source,
        })?;

    let log_file = supervisor.log_file(name);
    let mut command = log_command(&log_file, follow);
    command.io(Io::Inherit).run().await?;
    Ok(())
}

fn log_command(log_file: &Path, follow: bool) -> Cmd {
    let mut command = if follow {
        let mut tail = Cmd::new("tail");
        tail.args(["-n", "100", "-f"]);
        tail
    } else {
        Cmd::new("cat")
    };
    command.arg(log_file);
    command
}
