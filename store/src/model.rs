use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf, time::SystemTime};

pub const DEFAULT_VERSION: &str = "6.4.2";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Written just before the hypervisor is spawned.
    Starting,
    Running,
    Stopped,
}

impl Status {
    /// Whether a hypervisor process is (supposed to be) attached to the instance.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Starting | Status::Running)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Status::Starting => "STARTING",
            Status::Running => "RUNNING",
            Status::Stopped => "STOPPED",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: Status,
    pub pid: Option<u32>,
    pub cpu: String,
    pub cpus: u16,
    pub memory: String,
    pub disk_format: String,
    pub disk_size: Option<String>,
    pub drive_path: Option<PathBuf>,
    pub iso_path: Option<PathBuf>,
    pub bridge: Option<String>,
    pub port_forward: Option<String>,
    pub mac_address: String,
    pub version: String,
    #[serde(with = "crate::time::rfc3339")]
    pub created_at: SystemTime,
    #[serde(with = "crate::time::rfc3339")]
    pub updated_at: SystemTime,
}

impl Instance {
    /// A stopped instance with default hardware and no drive.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        mac_address: impl Into<String>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            name: name.into(),
            status: Status::Stopped,
            pid: None,
            cpu: "host".to_owned(),
            cpus: 2,
            memory: "2G".to_owned(),
            disk_format: "raw".to_owned(),
            disk_size: None,
            drive_path: None,
            iso_path: None,
            bridge: None,
            port_forward: None,
            mac_address: mac_address.into(),
            version: DEFAULT_VERSION.to_owned(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_bridged(&self) -> bool {
        self.bridge.is_some()
    }
}

/// What a transition does to the stored pid.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PidChange {
    Keep,
    Set(u32),
    Clear,
}

/// Fields touched by a status transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub status: Status,
    pub pid: PidChange,
}

impl InstanceUpdate {
    /// Keeps the stored pid, so a stopped record still shows its last process.
    pub fn status(status: Status) -> Self {
        Self {
            status,
            pid: PidChange::Keep,
        }
    }

    pub fn with_pid(status: Status, pid: u32) -> Self {
        Self {
            status,
            pid: PidChange::Set(pid),
        }
    }

    /// `STARTING` with no pid: nothing has been spawned for this launch yet.
    pub fn starting() -> Self {
        Self {
            status: Status::Starting,
            pid: PidChange::Clear,
        }
    }

    pub(crate) fn apply(self, instance: &mut Instance) {
        instance.status = self.status;
        match self.pid {
            PidChange::Keep => {}
            PidChange::Set(pid) => instance.pid = Some(pid),
            PidChange::Clear => instance.pid = None,
        }
        instance.updated_at = SystemTime::now();
    }
}

/// A registered base image that volumes can be layered on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub format: String,
    pub size: Option<String>,
    #[serde(with = "crate::time::rfc3339")]
    pub created_at: SystemTime,
}

impl Image {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        Self {
            id: cuid2::create_id(),
            name: name.into(),
            path: path.into(),
            format: format.into(),
            size: None,
            created_at: SystemTime::now(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.name == key || self.path.as_os_str() == key
    }
}

/// A copy-on-write qcow2 overlay on top of an [`Image`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub base_image_id: String,
    pub path: PathBuf,
    pub size: Option<String>,
    #[serde(with = "crate::time::rfc3339")]
    pub created_at: SystemTime,
}

impl Volume {
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.name == key || self.path.as_os_str() == key
    }
}
