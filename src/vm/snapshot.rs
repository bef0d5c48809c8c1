use crate::backend::Capabilities;

use super::configuration::VmConfigurationData;

/// The snapshot name used for suspend/resume when the caller does not pick one.
pub const DEFAULT_SNAPSHOT_NAME: &str = "suspend";

/// Why saving or restoring machine state is not possible for a VM as currently
/// configured. Evaluated against the live configuration, not just the static backend
/// capability flag, so callers fail fast instead of deep inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotUnsupportedReason {
    /// The backend kind has no snapshot primitives at all.
    BackendIncapable,
    /// At least one display is GPU-accelerated; accelerator state cannot be saved.
    GpuAcceleratedDisplay,
    /// A drive is attached over an interface whose controller state cannot be saved.
    IncompatibleDriveInterface(String),
    /// The session is disposable, so there is no state worth saving.
    DisposableSession,
    /// A host device is passed through to the guest and cannot be reattached on restore.
    HostDeviceAttached(String),
}

impl std::fmt::Display for SnapshotUnsupportedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotUnsupportedReason::BackendIncapable => {
                write!(f, "the backend does not implement snapshots")
            }
            SnapshotUnsupportedReason::GpuAcceleratedDisplay => {
                write!(f, "a GPU-accelerated display is configured")
            }
            SnapshotUnsupportedReason::IncompatibleDriveInterface(drive_id) => {
                write!(f, "drive `{drive_id}` uses an interface incompatible with snapshots")
            }
            SnapshotUnsupportedReason::DisposableSession => {
                write!(f, "the session is running in disposable mode")
            }
            SnapshotUnsupportedReason::HostDeviceAttached(device) => {
                write!(f, "host device `{device}` is attached to the guest")
            }
        }
    }
}

/// Evaluate every snapshot gate for the given backend capabilities and current device
/// configuration, reporting the first failing predicate.
pub fn snapshot_support(
    capabilities: Capabilities,
    configuration: &VmConfigurationData,
) -> Result<(), SnapshotUnsupportedReason> {
    if !capabilities.supports_snapshots {
        return Err(SnapshotUnsupportedReason::BackendIncapable);
    }

    if configuration.disposable {
        return Err(SnapshotUnsupportedReason::DisposableSession);
    }

    if configuration.displays.iter().any(|display| display.gpu_accelerated) {
        return Err(SnapshotUnsupportedReason::GpuAcceleratedDisplay);
    }

    if let Some(drive) = configuration
        .drives
        .iter()
        .find(|drive| !drive.interface.supports_snapshots())
    {
        return Err(SnapshotUnsupportedReason::IncompatibleDriveInterface(
            drive.drive_id.clone(),
        ));
    }

    if let Some(device) = configuration.attached_host_devices.first() {
        return Err(SnapshotUnsupportedReason::HostDeviceAttached(device.clone()));
    }

    Ok(())
}
