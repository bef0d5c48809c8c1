#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use uuid::Uuid;
use vmhelm::{
    backend::{Backend, BackendError, Capabilities, StartOptions, StopMethod},
    registry::RegistryStore,
    resource::{ResourceError, ResourceTracker, ScopedAccess},
    vm::{
        VmController,
        configuration::{DriveConfiguration, DriveInterface, VmConfigurationData},
    },
};

/// A scripted backend that records every invocation, fails exactly the operations it
/// is told to fail and delays exactly the operations it is told to delay.
#[derive(Default)]
pub struct MockBackend {
    capabilities: Capabilities,
    failing: Mutex<HashSet<&'static str>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            ..Self::default()
        })
    }

    pub fn with_start_delay(capabilities: Capabilities, start_delay: Duration) -> Arc<Self> {
        let backend = Self::new(capabilities);
        backend.delay_on("start", start_delay);
        backend
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn delay_on(&self, operation: &'static str, delay: Duration) {
        self.delays.lock().unwrap().insert(operation, delay);
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| *call == operation)
            .count()
    }

    fn record(&self, operation: impl Into<String>) {
        self.calls.lock().unwrap().push(operation.into());
    }

    async fn outcome(&self, operation: &'static str) -> Result<(), BackendError> {
        let delay = self.delays.lock().unwrap().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(operation) {
            Err(BackendError::Rejected(format!("`{operation}` scripted to fail")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn start(&self, _options: &StartOptions) -> Result<(), BackendError> {
        self.record("start");
        self.outcome("start").await
    }

    async fn stop(&self, method: StopMethod) -> Result<(), BackendError> {
        self.record(format!("stop_{method}"));
        self.outcome("stop").await
    }

    async fn pause(&self) -> Result<(), BackendError> {
        self.record("pause");
        self.outcome("pause").await
    }

    async fn resume(&self) -> Result<(), BackendError> {
        self.record("resume");
        self.outcome("resume").await
    }

    async fn save_snapshot(&self, _name: &str) -> Result<(), BackendError> {
        self.record("save_snapshot");
        self.outcome("save_snapshot").await
    }

    async fn restore_snapshot(&self, _name: &str) -> Result<(), BackendError> {
        self.record("restore_snapshot");
        self.outcome("restore_snapshot").await
    }

    async fn delete_snapshot(&self, _name: &str) -> Result<(), BackendError> {
        self.record("delete_snapshot");
        self.outcome("delete_snapshot").await
    }
}

/// A backend whose engine/architecture combination cannot run on this host.
pub struct UnsupportedBackend;

#[async_trait]
impl Backend for UnsupportedBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn is_supported(&self) -> bool {
        false
    }

    async fn start(&self, _options: &StartOptions) -> Result<(), BackendError> {
        unreachable!("an unsupported backend must never be started")
    }

    async fn stop(&self, _method: StopMethod) -> Result<(), BackendError> {
        Ok(())
    }

    async fn pause(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn save_snapshot(&self, _name: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn restore_snapshot(&self, _name: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn delete_snapshot(&self, _name: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A [ScopedAccess] that counts begin/end bracket edges.
#[derive(Default)]
pub struct CountingAccessState {
    pub begins: AtomicUsize,
    pub ends: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct CountingAccess(pub Arc<CountingAccessState>);

impl CountingAccess {
    pub fn begins(&self) -> usize {
        self.0.begins.load(Ordering::Acquire)
    }

    pub fn ends(&self) -> usize {
        self.0.ends.load(Ordering::Acquire)
    }
}

impl ScopedAccess for CountingAccess {
    fn begin(&self, _url: &Path) -> Result<(), ResourceError> {
        self.0.begins.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn end(&self, _url: &Path) {
        self.0.ends.fetch_add(1, Ordering::AcqRel);
    }
}

/// A [ScopedAccess] that denies every bracket.
pub struct DenyingAccess;

impl ScopedAccess for DenyingAccess {
    fn begin(&self, url: &Path) -> Result<(), ResourceError> {
        Err(ResourceError::AccessDenied {
            url: url.to_path_buf(),
            reason: "denied by test".to_owned(),
        })
    }

    fn end(&self, _url: &Path) {}
}

pub fn write_drive_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"drive image").unwrap();
    path
}

pub fn external_cd_configuration(image: &Path) -> VmConfigurationData {
    VmConfigurationData::new("test-vm").drive(
        DriveConfiguration::new("cd0", DriveInterface::Usb)
            .external(true)
            .path_on_host(image)
            .read_only(true),
    )
}

pub fn short_window_store(dir: &Path) -> RegistryStore {
    RegistryStore::open_with_window(dir.join("registry.json"), Duration::from_millis(50)).unwrap()
}

pub fn controller_with(
    dir: &Path,
    configuration: VmConfigurationData,
    backend: Arc<dyn Backend>,
    tracker: ResourceTracker,
) -> Arc<VmController> {
    let store = short_window_store(dir);
    controller_with_store(dir, configuration, backend, tracker, store)
}

pub fn controller_with_store(
    dir: &Path,
    configuration: VmConfigurationData,
    backend: Arc<dyn Backend>,
    tracker: ResourceTracker,
    store: RegistryStore,
) -> Arc<VmController> {
    Arc::new(VmController::new(
        Uuid::new_v4(),
        dir.join("test-vm.vm"),
        configuration,
        backend,
        tracker,
        store,
    ))
}
