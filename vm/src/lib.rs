mod host;
mod image;
mod launch;
mod lock;
mod mac;
mod network;
mod qemu;
mod signal;
mod supervisor;
mod terminate;
#[cfg(test)]
mod testing;
mod volume;

pub use crate::host::HostOs;
pub use crate::image::{DriveImageError, create_drive_image_if_needed};
pub use crate::launch::{AttachedProcess, LaunchError, Launcher, ProcessExit, ProcessLauncher};
pub use crate::lock::{InstanceLock, LockError};
pub use crate::mac::mac_address_for;
pub use crate::network::{netdev_arg, port_forwards};
pub use crate::qemu::{ComposeOptions, QemuInvocation, StartOverrides, compose};
pub use crate::signal::{ProcessSignaller, SignalKind, Signaller};
pub use crate::supervisor::{
    RunOptions, StartMode, Supervisor, SupervisorError, SupervisorOptions, Timings,
};
pub use crate::terminate::{TerminateError, Termination, terminate};
pub use crate::volume::{VOLUME_FORMAT, VolumeError, resolve_volume, with_volume};
