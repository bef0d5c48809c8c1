use std::time::Duration;

use assert_matches::assert_matches;
use vmhelm::{
    backend::{Capabilities, StartOptions, StopMethod},
    resource::ResourceTracker,
    vm::{
        VmError, VmState,
        configuration::{
            DisplayConfiguration, DriveConfiguration, DriveInterface, VmConfigurationData,
        },
        snapshot::{SnapshotUnsupportedReason, snapshot_support},
    },
};

mod common;

use common::{
    MockBackend, controller_with, controller_with_store, external_cd_configuration,
    short_window_store, write_drive_image,
};

fn snapshot_capable() -> Capabilities {
    Capabilities {
        supports_snapshots: true,
        ..Capabilities::default()
    }
}

#[test]
fn gating_predicates_cover_configuration_not_just_capability() {
    let plain = VmConfigurationData::new("plain");
    assert_matches!(snapshot_support(snapshot_capable(), &plain), Ok(()));
    assert_matches!(
        snapshot_support(Capabilities::default(), &plain),
        Err(SnapshotUnsupportedReason::BackendIncapable)
    );

    let accelerated = VmConfigurationData::new("gpu").display(DisplayConfiguration::new(true));
    assert_matches!(
        snapshot_support(snapshot_capable(), &accelerated),
        Err(SnapshotUnsupportedReason::GpuAcceleratedDisplay)
    );

    let nvme = VmConfigurationData::new("nvme")
        .drive(DriveConfiguration::new("hd0", DriveInterface::Nvme));
    assert_matches!(
        snapshot_support(snapshot_capable(), &nvme),
        Err(SnapshotUnsupportedReason::IncompatibleDriveInterface(id)) if id == "hd0"
    );

    let disposable = VmConfigurationData::new("throwaway").disposable(true);
    assert_matches!(
        snapshot_support(snapshot_capable(), &disposable),
        Err(SnapshotUnsupportedReason::DisposableSession)
    );

    let mut passthrough = VmConfigurationData::new("usb");
    passthrough.attached_host_devices.push("usb-0451:16a8".to_owned());
    assert_matches!(
        snapshot_support(snapshot_capable(), &passthrough),
        Err(SnapshotUnsupportedReason::HostDeviceAttached(_))
    );
}

#[tokio::test]
async fn gpu_accelerated_display_fails_fast_without_touching_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());

    let configuration = VmConfigurationData::new("gpu-vm").display(DisplayConfiguration::new(true));
    let controller = controller_with(dir.path(), configuration, backend.clone(), ResourceTracker::host());

    controller.start(StartOptions::new()).await.unwrap();
    let result = controller.save_snapshot(None).await;

    assert_matches!(
        result,
        Err(VmError::SnapshotUnsupported(SnapshotUnsupportedReason::GpuAcceleratedDisplay))
    );
    assert_eq!(backend.call_count("save_snapshot"), 0);
    assert!(!controller.registry_entry().unwrap().suspended);
    assert_eq!(controller.state(), VmState::Started);
}

#[tokio::test]
async fn default_name_save_marks_the_vm_suspended() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());

    let controller = controller_with(
        dir.path(),
        VmConfigurationData::new("suspend-vm"),
        backend.clone(),
        ResourceTracker::host(),
    );

    controller.start(StartOptions::new()).await.unwrap();
    controller.save_snapshot(None).await.unwrap();

    assert!(controller.registry_entry().unwrap().suspended);
    assert_eq!(controller.state(), VmState::Started);
    assert_eq!(backend.call_count("save_snapshot"), 1);
}

#[tokio::test]
async fn named_save_does_not_touch_the_suspend_flag() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());

    let controller = controller_with(
        dir.path(),
        VmConfigurationData::new("named-vm"),
        backend,
        ResourceTracker::host(),
    );

    controller.start(StartOptions::new()).await.unwrap();
    controller.save_snapshot(Some("before-upgrade")).await.unwrap();

    assert!(!controller.registry_entry().unwrap().suspended);
}

#[tokio::test]
async fn failed_save_leaves_the_suspend_flag_clear() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());
    backend.fail_on("save_snapshot");

    let controller = controller_with(
        dir.path(),
        VmConfigurationData::new("failing-save"),
        backend,
        ResourceTracker::host(),
    );

    controller.start(StartOptions::new()).await.unwrap();
    let result = controller.save_snapshot(None).await;

    assert_matches!(result, Err(VmError::Backend(_)));
    assert!(!controller.registry_entry().unwrap().suspended);
    assert_eq!(controller.state(), VmState::Started);
}

#[tokio::test]
async fn kill_during_save_is_not_overwritten_by_the_save_completion() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_drive_image(dir.path(), "boot.iso");
    let backend = MockBackend::new(snapshot_capable());
    backend.delay_on("save_snapshot", Duration::from_millis(200));
    let tracker = ResourceTracker::host();

    let controller = controller_with(
        dir.path(),
        external_cd_configuration(&image),
        backend.clone(),
        tracker.clone(),
    );

    controller.start(StartOptions::new()).await.unwrap();

    let racing = controller.clone();
    let save = tokio::spawn(async move { racing.save_snapshot(None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    controller.stop(StopMethod::Kill).await.unwrap();
    assert_eq!(controller.state(), VmState::Stopped);

    // The backend confirmed the save, so the flag is recorded, but the completion
    // must not resurrect a running state over the torn-down session.
    save.await.unwrap().unwrap();
    assert_eq!(controller.state(), VmState::Stopped);
    assert_eq!(tracker.refcount(&image), 0);
    assert!(controller.registry_entry().unwrap().suspended);
}

#[tokio::test]
async fn restore_clears_the_suspend_flag() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());

    let controller = controller_with(
        dir.path(),
        VmConfigurationData::new("restore-vm"),
        backend,
        ResourceTracker::host(),
    );

    controller.start(StartOptions::new()).await.unwrap();
    controller.save_snapshot(None).await.unwrap();
    assert!(controller.registry_entry().unwrap().suspended);

    controller.restore_snapshot(None).await.unwrap();
    assert!(!controller.registry_entry().unwrap().suspended);
}

#[tokio::test]
async fn failed_restore_attempts_cleanup_and_surfaces_the_primary_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());
    backend.fail_on("restore_snapshot");

    let controller = controller_with(
        dir.path(),
        VmConfigurationData::new("failing-restore"),
        backend.clone(),
        ResourceTracker::host(),
    );

    controller.start(StartOptions::new()).await.unwrap();
    let result = controller.restore_snapshot(Some("broken")).await;

    assert_matches!(result, Err(VmError::Backend(_)));
    assert_eq!(backend.call_count("delete_snapshot"), 1);
    assert_eq!(controller.state(), VmState::Started);
}

#[tokio::test]
async fn deleting_the_suspend_snapshot_clears_the_flag() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());

    let controller = controller_with(
        dir.path(),
        VmConfigurationData::new("delete-vm"),
        backend.clone(),
        ResourceTracker::host(),
    );

    controller.start(StartOptions::new()).await.unwrap();
    controller.save_snapshot(None).await.unwrap();

    // Deletion also works from the stopped state.
    controller.stop(vmhelm::backend::StopMethod::Force).await.unwrap();
    controller.delete_snapshot(None).await.unwrap();

    assert!(!controller.registry_entry().unwrap().suspended);
    assert_eq!(backend.call_count("delete_snapshot"), 1);
}

#[tokio::test]
async fn suspended_vm_restores_on_the_next_start() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());
    let store = short_window_store(dir.path());

    let controller = controller_with_store(
        dir.path(),
        VmConfigurationData::new("resumable"),
        backend.clone(),
        ResourceTracker::host(),
        store.clone(),
    );

    store.update(controller.uuid(), |entry| entry.suspended = true);

    controller.start(StartOptions::new()).await.unwrap();

    assert_eq!(backend.call_count("restore_snapshot"), 1);
    assert!(!controller.registry_entry().unwrap().suspended);
    assert_eq!(controller.state(), VmState::Started);
}

#[tokio::test]
async fn boot_fresh_skips_the_suspend_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(snapshot_capable());
    let store = short_window_store(dir.path());

    let controller = controller_with_store(
        dir.path(),
        VmConfigurationData::new("fresh-boot"),
        backend.clone(),
        ResourceTracker::host(),
        store.clone(),
    );

    store.update(controller.uuid(), |entry| entry.suspended = true);

    controller.start(StartOptions::new().boot_fresh(true)).await.unwrap();

    assert_eq!(backend.call_count("restore_snapshot"), 0);
    assert!(controller.registry_entry().unwrap().suspended);
}

#[tokio::test]
async fn recovery_boot_requires_the_capability() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(Capabilities::default());

    let controller = controller_with(
        dir.path(),
        VmConfigurationData::new("recovery-vm"),
        backend,
        ResourceTracker::host(),
    );

    assert_matches!(
        controller.start(StartOptions::new().recovery(true)).await,
        Err(VmError::BackendUnavailable)
    );
    assert_eq!(controller.state(), VmState::Stopped);
}
