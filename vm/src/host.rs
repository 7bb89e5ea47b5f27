#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOs {
    Linux,
    MacOs,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => HostOs::Linux,
            "macos" => HostOs::MacOs,
            _ => HostOs::Other,
        }
    }

    /// KVM acceleration only exists on Linux hosts.
    pub fn supports_kvm(self) -> bool {
        self == HostOs::Linux
    }
}
