use dfly_cmd::Command;
use dfly_store::Instance;
use std::{fmt::Display, path::Path, path::PathBuf};

use crate::{host::HostOs, network::netdev_arg};

/// Per-invocation settings that supersede the stored record without mutating it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOverrides {
    pub memory: Option<String>,
    pub cpus: Option<u16>,
    pub cpu: Option<String>,
    pub disk_format: Option<String>,
    pub port_forward: Option<String>,
    pub drive_path: Option<PathBuf>,
    pub bridge: Option<String>,
    pub disk_size: Option<String>,
    /// Boot from this named volume, creating it when missing.
    pub volume: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ComposeOptions {
    pub qemu_binary: String,
    pub sudo_binary: String,
    pub host_os: HostOs,
    pub snapshot: bool,
    /// Pass `-n` to the privilege wrapper so it fails instead of prompting.
    pub non_interactive: bool,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            qemu_binary: "qemu-system-x86_64".to_owned(),
            sudo_binary: "sudo".to_owned(),
            host_os: HostOs::current(),
            snapshot: false,
            non_interactive: false,
        }
    }
}

/// The program to execute and its full argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl QemuInvocation {
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl Display for QemuInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Argument builder, one method per group of flags.
#[derive(Debug, Default)]
struct QemuArgs {
    args: Vec<String>,
}

impl QemuArgs {
    fn flag(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.args.push(flag.to_owned());
        self.args.push(value.into());
        self
    }

    /// Hypervisor binary as the first argument of the privilege wrapper.
    fn wrapped(mut self, qemu_binary: &str, non_interactive: bool) -> Self {
        if non_interactive {
            self.args.push("-n".to_owned());
        }
        self.args.push(qemu_binary.to_owned());
        self
    }

    fn enable_kvm(mut self, enabled: bool) -> Self {
        if enabled {
            self.args.push("-enable-kvm".to_owned());
        }
        self
    }

    /// CPU model, memory and CPU count: -cpu <model> -m <size> -smp <n>
    fn hardware(self, cpu: &str, memory: &str, cpus: u16) -> Self {
        self.flag("-cpu", cpu)
            .flag("-m", memory)
            .flag("-smp", cpus.to_string())
    }

    fn cdrom(self, iso_path: Option<&Path>) -> Self {
        match iso_path {
            Some(iso_path) => self.flag("-cdrom", iso_path.to_string_lossy()),
            None => self,
        }
    }

    /// e1000 NIC on `net0` with a fixed MAC.
    fn network(self, netdev: String, mac_address: &str) -> Self {
        self.flag("-netdev", netdev)
            .flag("-device", format!("e1000,netdev=net0,mac={mac_address}"))
    }

    /// No display, console on a serial port bound to stdio.
    fn headless(self) -> Self {
        self.flag("-display", "none")
            .flag("-vga", "none")
            .flag("-monitor", "none")
            .flag("-chardev", "stdio,id=con0,signal=off")
            .flag("-serial", "chardev:con0")
    }

    fn virtio_drive(self, drive_path: Option<&Path>, format: &str) -> Self {
        match drive_path {
            Some(drive_path) => {
                let file = drive_path.to_string_lossy();
                self.flag("-drive", format!("file={file},format={format},if=virtio"))
            }
            None => self,
        }
    }

    fn snapshot(mut self, enabled: bool) -> Self {
        if enabled {
            self.args.push("-snapshot".to_owned());
        }
        self
    }
}

/// Builds the hypervisor invocation for `instance`, with `overrides` taking precedence.
pub fn compose(
    instance: &Instance,
    overrides: &StartOverrides,
    options: &ComposeOptions,
) -> QemuInvocation {
    let bridge = overrides.bridge.as_deref().or(instance.bridge.as_deref());
    let port_forward = overrides
        .port_forward
        .as_deref()
        .or(instance.port_forward.as_deref());
    let cpu = overrides.cpu.as_deref().unwrap_or(&instance.cpu);
    let memory = overrides.memory.as_deref().unwrap_or(&instance.memory);
    let cpus = overrides.cpus.unwrap_or(instance.cpus);
    let disk_format = overrides
        .disk_format
        .as_deref()
        .unwrap_or(&instance.disk_format);
    let drive_path = overrides
        .drive_path
        .as_deref()
        .or(instance.drive_path.as_deref());

    let mut args = QemuArgs::default();
    let program = match bridge {
        Some(_) => {
            args = args.wrapped(&options.qemu_binary, options.non_interactive);
            options.sudo_binary.clone()
        }
        None => options.qemu_binary.clone(),
    };

    let args = args
        .enable_kvm(options.host_os.supports_kvm())
        .hardware(cpu, memory, cpus)
        .cdrom(instance.iso_path.as_deref())
        .network(netdev_arg(port_forward, bridge), &instance.mac_address)
        .headless()
        .virtio_drive(drive_path, disk_format)
        .snapshot(options.snapshot);

    QemuInvocation {
        program,
        args: args.args,
    }
}
