use std::path::PathBuf;

/// The in-memory view of the device configuration a controller needs for lifecycle
/// decisions: which locations live outside the VM's own storage sandbox and which
/// device choices gate snapshotting. The on-disk configuration schema and its encoding
/// belong to the embedding application, not to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmConfigurationData {
    pub name: String,
    pub drives: Vec<DriveConfiguration>,
    pub shared_directories: Vec<SharedDirectory>,
    pub displays: Vec<DisplayConfiguration>,
    /// A disposable session discards all writes on stop.
    pub disposable: bool,
    /// Host devices passed through to the guest (USB, serial ports), named for
    /// diagnostics only.
    pub attached_host_devices: Vec<String>,
}

impl VmConfigurationData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn drive(mut self, drive: DriveConfiguration) -> Self {
        self.drives.push(drive);
        self
    }

    pub fn shared_directory(mut self, share: SharedDirectory) -> Self {
        self.shared_directories.push(share);
        self
    }

    pub fn display(mut self, display: DisplayConfiguration) -> Self {
        self.displays.push(display);
        self
    }

    pub fn disposable(mut self, disposable: bool) -> Self {
        self.disposable = disposable;
        self
    }

    /// Every location outside the VM's own storage sandbox that a running session needs
    /// scoped access to: external drive images first, then shared directories.
    pub fn external_urls(&self) -> Vec<PathBuf> {
        let mut urls = Vec::new();

        for drive in &self.drives {
            if drive.external {
                if let Some(ref path) = drive.path_on_host {
                    urls.push(path.clone());
                }
            }
        }

        for share in &self.shared_directories {
            urls.push(share.path.clone());
        }

        urls
    }
}

/// The guest-visible interface a drive is attached over. Some interfaces are
/// incompatible with saving and restoring machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveInterface {
    Virtio,
    Ide,
    Usb,
    Nvme,
}

impl DriveInterface {
    pub fn supports_snapshots(&self) -> bool {
        !matches!(self, DriveInterface::Nvme)
    }
}

impl std::fmt::Display for DriveInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveInterface::Virtio => write!(f, "virtio"),
            DriveInterface::Ide => write!(f, "ide"),
            DriveInterface::Usb => write!(f, "usb"),
            DriveInterface::Nvme => write!(f, "nvme"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveConfiguration {
    pub drive_id: String,
    pub interface: DriveInterface,
    /// Whether the drive image lives outside the VM's own storage sandbox.
    pub external: bool,
    pub path_on_host: Option<PathBuf>,
    pub read_only: bool,
}

impl DriveConfiguration {
    pub fn new(drive_id: impl Into<String>, interface: DriveInterface) -> Self {
        Self {
            drive_id: drive_id.into(),
            interface,
            external: false,
            path_on_host: None,
            read_only: false,
        }
    }

    pub fn external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    pub fn path_on_host(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_on_host = Some(path.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDirectory {
    pub path: PathBuf,
    pub read_only: bool,
}

impl SharedDirectory {
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayConfiguration {
    pub gpu_accelerated: bool,
}

impl DisplayConfiguration {
    pub fn new(gpu_accelerated: bool) -> Self {
        Self { gpu_accelerated }
    }
}
