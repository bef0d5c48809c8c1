use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    backend::{Backend, BackendError, Capabilities, StartOptions, StopMethod},
    registry::{Bookmark, FileRef, RegistryEntry, RegistryStore, WindowState},
    resource::{ResourceError, ResourceTracker, ScopedResource, canonical_url},
};
use configuration::{SharedDirectory, VmConfigurationData};
use snapshot::{DEFAULT_SNAPSHOT_NAME, SnapshotUnsupportedReason, snapshot_support};

pub mod configuration;
pub mod snapshot;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_SCREENSHOT_INTERVAL: Duration = Duration::from_secs(3);

/// The lifecycle state of a VM. `Stopped` is the only terminal/idle state; every other
/// state is transient and resolves back to `Stopped`, `Started` or `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Starting,
    Started,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Saving,
    Restoring,
}

impl VmState {
    /// Whether no lifecycle operation is in flight for this state.
    pub fn is_settled(&self) -> bool {
        matches!(self, VmState::Stopped | VmState::Started | VmState::Paused)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Stopped => write!(f, "Stopped"),
            VmState::Starting => write!(f, "Starting"),
            VmState::Started => write!(f, "Started"),
            VmState::Pausing => write!(f, "Pausing"),
            VmState::Paused => write!(f, "Paused"),
            VmState::Resuming => write!(f, "Resuming"),
            VmState::Stopping => write!(f, "Stopping"),
            VmState::Saving => write!(f, "Saving"),
            VmState::Restoring => write!(f, "Restoring"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("Expected the VM to be in the `{expected}` state, but it was actually in the `{actual}` state")]
    ExpectedState { expected: VmState, actual: VmState },
    #[error("Expected the VM to be either paused or running, but it was actually in the `{actual}` state")]
    ExpectedPausedOrRunning { actual: VmState },
    #[error("Expected the VM to not be in the `Stopped` state")]
    ExpectedNotStopped,
    #[error("Another lifecycle operation is in flight, the VM is in the transient `{actual}` state")]
    OperationInFlight { actual: VmState },
    #[error("A required external resource could not be accessed: `{0}`")]
    ResourceAccess(#[from] ResourceError),
    #[error("The selected backend is not supported on this host")]
    BackendUnavailable,
    #[error("Saving or restoring machine state is not possible: {0}")]
    SnapshotUnsupported(SnapshotUnsupportedReason),
    #[error("The backend returned an error: `{0}`")]
    Backend(#[from] BackendError),
    #[error("The in-flight operation was cancelled")]
    Cancelled,
    #[error("No drive with the id `{0}` is configured")]
    UnknownDrive(String),
    #[error("Drive `{0}` is not backed by an external image")]
    DriveNotExternal(String),
    #[error("No shared directory is configured at index {0}")]
    UnknownSharedDirectory(usize),
}

/// Change notifications emitted by a [VmController]. Consumers subscribe via
/// [VmController::subscribe]; nothing upstream holds references into the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEvent {
    StateChanged(VmState),
    ConfigurationChanged,
    RegistryChanged,
}

/// The state machine orchestrating one VM's lifecycle over a pluggable [Backend].
///
/// The controller owns the single authoritative [VmState] and serializes all lifecycle
/// operations against it: "check state, then set state" is one atomic step under an
/// internal mutex held only for that step, so the state field itself is both the guard
/// and the audit trail. An operation invoked from the wrong state is rejected
/// immediately, never queued. Every operation fully unwinds its own partial side
/// effects (scoped resources released, state reverted) before returning an error.
///
/// Each transient operation additionally records the session epoch it began under;
/// the epoch advances whenever a session is torn down to `Stopped`, so an unwind that
/// lost a race against `Kill` backs off instead of disturbing the successor session.
pub struct VmController {
    uuid: Uuid,
    backend: Arc<dyn Backend>,
    tracker: ResourceTracker,
    store: RegistryStore,
    state: Mutex<VmState>,
    session: AtomicU64,
    configuration: Mutex<VmConfigurationData>,
    held: Mutex<Vec<ScopedResource>>,
    cancel: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<VmEvent>,
    status_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    screenshot_interval: Duration,
}

impl VmController {
    /// Construct a controller for one VM, lazily creating its registry entry on first
    /// reference.
    pub fn new(
        uuid: Uuid,
        package_path: impl Into<PathBuf>,
        configuration: VmConfigurationData,
        backend: Arc<dyn Backend>,
        tracker: ResourceTracker,
        store: RegistryStore,
    ) -> Self {
        let package_path = package_path.into();
        let name = configuration.name.clone();
        store.entry_or_insert_with(uuid, || {
            RegistryEntry::new(uuid, name, FileRef::new(&package_path, false))
        });

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            uuid,
            backend,
            tracker,
            store,
            state: Mutex::new(VmState::Stopped),
            session: AtomicU64::new(0),
            configuration: Mutex::new(configuration),
            held: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
            events,
            status_task: Mutex::new(None),
            screenshot_interval: DEFAULT_SCREENSHOT_INTERVAL,
        }
    }

    pub fn screenshot_interval(mut self, interval: Duration) -> Self {
        self.screenshot_interval = interval;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> VmState {
        *self.state.lock().unwrap()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub fn configuration(&self) -> VmConfigurationData {
        self.configuration.lock().unwrap().clone()
    }

    pub fn registry_entry(&self) -> Option<RegistryEntry> {
        self.store.entry(self.uuid)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.events.subscribe()
    }

    /// Boot the VM. Fails cheaply with [VmError::BackendUnavailable] before any
    /// resource acquisition if the backend cannot run on this host, then acquires
    /// scoped access to every externally referenced location, delegates to the backend
    /// and, when the registry marks the VM as suspended and a fresh boot was not
    /// requested, restores the suspend snapshot before finishing.
    ///
    /// On any failure or cancellation, every resource acquired by this call is released
    /// and the state returns to `Stopped`; the error is surfaced, never swallowed.
    pub async fn start(&self, options: StartOptions) -> Result<(), VmError> {
        if !self.backend.is_supported() {
            return Err(VmError::BackendUnavailable);
        }

        if options.recovery && !self.backend.capabilities().supports_recovery_mode {
            return Err(VmError::BackendUnavailable);
        }

        let epoch = self.try_begin(VmState::Stopped, VmState::Starting)?;

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(token.clone());

        match self.run_start(&options, &token).await {
            Ok(acquired) => {
                if self.finish_start(epoch, acquired) {
                    *self.cancel.lock().unwrap() = None;
                    self.arm_status_task();
                    Ok(())
                } else {
                    // A concurrent kill superseded this start; its teardown owns the
                    // session now and the fresh acquisitions have already unwound.
                    Err(VmError::Cancelled)
                }
            }
            Err(err) => {
                tracing::error!(vm = %self.uuid, error = %err, "start failed");

                if let Some(held) = self.abort_start(epoch) {
                    *self.cancel.lock().unwrap() = None;
                    for resource in held {
                        resource.release();
                    }
                }

                Err(err)
            }
        }
    }

    async fn run_start(
        &self,
        options: &StartOptions,
        token: &CancellationToken,
    ) -> Result<Vec<ScopedResource>, VmError> {
        // Scoped access for every externally referenced location. The holders stay
        // local to this call until the start commits, so a concurrent teardown never
        // races against a half-filled session table.
        let urls = self.configuration.lock().unwrap().external_urls();
        let mut acquired = Vec::with_capacity(urls.len());
        for url in urls {
            acquired.push(self.tracker.acquire(url)?);
        }

        if token.is_cancelled() {
            return Err(VmError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                // The backend call was interrupted mid-flight; it may or may not have
                // brought the engine up, so a kill covers both outcomes.
                self.kill_backend_best_effort().await;
                return Err(VmError::Cancelled);
            }
            result = self.backend.start(options) => result?,
        }

        let suspended = self.store.entry(self.uuid).map(|entry| entry.suspended).unwrap_or(false);

        if suspended && !options.boot_fresh {
            let restored = tokio::select! {
                biased;
                _ = token.cancelled() => Err(VmError::Cancelled),
                result = self.backend.restore_snapshot(DEFAULT_SNAPSHOT_NAME) => {
                    result.map_err(VmError::from)
                }
            };

            if let Err(err) = restored {
                self.kill_backend_best_effort().await;
                return Err(err);
            }

            self.store.update(self.uuid, |entry| entry.suspended = false);
            self.emit(VmEvent::RegistryChanged);
        }

        // Record the session's external locations in the registry and mint session
        // bookmarks for the backend process; those are valid only while it is alive.
        let configuration = self.configuration.lock().unwrap().clone();
        self.store.update(self.uuid, |entry| {
            entry.update_from_config(&configuration);

            for file in entry.external_drives.values_mut() {
                file.remote_bookmark = Some(Bookmark::mint(&file.path));
            }
            for file in &mut entry.shared_directories {
                file.remote_bookmark = Some(Bookmark::mint(&file.path));
            }
        });
        self.emit(VmEvent::RegistryChanged);

        Ok(acquired)
    }

    /// Stop the VM. `Request` asks the guest to shut down and changes no state here;
    /// the actual exit arrives later via [VmController::notify_guest_stopped]. `Force`
    /// requires a paused or running VM; `Kill` is permitted from any non-`Stopped`
    /// state as the universal escape hatch, cancelling an in-flight start if one is
    /// racing it.
    pub async fn stop(&self, method: StopMethod) -> Result<(), VmError> {
        match method {
            StopMethod::Request => {
                self.ensure_paused_or_running()?;
                self.backend.stop(StopMethod::Request).await?;
                Ok(())
            }
            StopMethod::Force => {
                self.try_begin_paused_or_running(VmState::Stopping)?;
                self.finish_stop(StopMethod::Force).await
            }
            StopMethod::Kill => {
                self.try_begin_not_stopped(VmState::Stopping)?;

                if let Some(token) = self.cancel.lock().unwrap().take() {
                    token.cancel();
                }

                self.finish_stop(StopMethod::Kill).await
            }
        }
    }

    async fn finish_stop(&self, method: StopMethod) -> Result<(), VmError> {
        let result = self.backend.stop(method).await;
        self.teardown_session();

        result.map_err(|err| {
            tracing::error!(vm = %self.uuid, %method, error = %err, "backend stop failed");
            err.into()
        })
    }

    /// The backend reported that the guest shut itself down (typically after a
    /// `Request` stop). Finalizes the session: resources released, session bookmarks
    /// cleared, state `Stopped`. A no-op when already stopped.
    pub fn notify_guest_stopped(&self) {
        // Check-and-claim in one step so a racing report or kill finalizes only once.
        {
            let mut state = self.state.lock().unwrap();
            if *state == VmState::Stopped {
                return;
            }
            *state = VmState::Stopping;
        }
        self.emit(VmEvent::StateChanged(VmState::Stopping));

        tracing::debug!(vm = %self.uuid, "guest-initiated stop reported by the backend");
        self.teardown_session();
    }

    /// Reboot a paused or running VM through a hard stop and a cold start. A failure
    /// anywhere leaves the VM in `Stopped`.
    pub async fn restart(&self) -> Result<(), VmError> {
        self.stop(StopMethod::Force).await?;
        self.start(StartOptions::new()).await
    }

    /// Pause a running VM. A backend failure here is treated as fatal to the session:
    /// the engine is killed best-effort and the VM lands in `Stopped`.
    pub async fn pause(&self) -> Result<(), VmError> {
        let epoch = self.try_begin(VmState::Started, VmState::Pausing)?;

        match self.backend.pause().await {
            Ok(()) => {
                self.finish_transition(epoch, VmState::Pausing, VmState::Paused);
                Ok(())
            }
            Err(err) => {
                tracing::error!(vm = %self.uuid, error = %err, "pause failed, stopping the session");
                if self.owns_session(epoch, VmState::Pausing) {
                    self.fail_session().await;
                }
                Err(err.into())
            }
        }
    }

    /// Resume a paused VM. Mirrors [VmController::pause], including the conservative
    /// failure policy.
    pub async fn resume(&self) -> Result<(), VmError> {
        let epoch = self.try_begin(VmState::Paused, VmState::Resuming)?;

        match self.backend.resume().await {
            Ok(()) => {
                self.finish_transition(epoch, VmState::Resuming, VmState::Started);
                Ok(())
            }
            Err(err) => {
                tracing::error!(vm = %self.uuid, error = %err, "resume failed, stopping the session");
                if self.owns_session(epoch, VmState::Resuming) {
                    self.fail_session().await;
                }
                Err(err.into())
            }
        }
    }

    /// Save machine state under the given name, or under the suspend name when `None`.
    /// Gated on backend capability and the current device configuration before the
    /// backend is ever involved. A successful suspend-name save marks the VM as
    /// suspended in the registry, and only after backend confirmation.
    pub async fn save_snapshot(&self, name: Option<&str>) -> Result<(), VmError> {
        self.ensure_snapshot_supported()?;
        let (prior, epoch) = self.try_begin_paused_or_running(VmState::Saving)?;
        let snapshot_name = name.unwrap_or(DEFAULT_SNAPSHOT_NAME);

        let result = self.backend.save_snapshot(snapshot_name).await;
        self.finish_transition(epoch, VmState::Saving, prior);

        match result {
            Ok(()) => {
                if name.is_none() {
                    self.store.update(self.uuid, |entry| entry.suspended = true);
                    self.emit(VmEvent::RegistryChanged);
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(vm = %self.uuid, snapshot = snapshot_name, error = %err, "snapshot save failed");
                Err(err.into())
            }
        }
    }

    /// Restore machine state saved under the given name, or under the suspend name when
    /// `None`. A successful restore clears the suspended flag. A failed restore
    /// attempts a best-effort delete of the snapshot whose own error never overrides
    /// the primary one.
    pub async fn restore_snapshot(&self, name: Option<&str>) -> Result<(), VmError> {
        self.ensure_snapshot_supported()?;
        let (prior, epoch) = self.try_begin_paused_or_running(VmState::Restoring)?;
        let snapshot_name = name.unwrap_or(DEFAULT_SNAPSHOT_NAME);

        let result = self.backend.restore_snapshot(snapshot_name).await;
        self.finish_transition(epoch, VmState::Restoring, prior);

        match result {
            Ok(()) => {
                self.store.update(self.uuid, |entry| entry.suspended = false);
                self.emit(VmEvent::RegistryChanged);
                Ok(())
            }
            Err(err) => {
                tracing::error!(vm = %self.uuid, snapshot = snapshot_name, error = %err, "snapshot restore failed");

                if let Err(cleanup_err) = self.backend.delete_snapshot(snapshot_name).await {
                    tracing::warn!(
                        vm = %self.uuid,
                        snapshot = snapshot_name,
                        error = %cleanup_err,
                        "cleanup delete after the failed restore also failed"
                    );
                }

                Err(err.into())
            }
        }
    }

    /// Delete the snapshot with the given name, or the suspend snapshot when `None`,
    /// from any settled state. Deleting the suspend snapshot clears the suspended flag.
    pub async fn delete_snapshot(&self, name: Option<&str>) -> Result<(), VmError> {
        self.ensure_settled()?;
        let snapshot_name = name.unwrap_or(DEFAULT_SNAPSHOT_NAME);

        self.backend.delete_snapshot(snapshot_name).await?;

        if name.is_none() {
            self.store.update(self.uuid, |entry| entry.suspended = false);
            self.emit(VmEvent::RegistryChanged);
        }

        Ok(())
    }

    /// Cooperatively cancel an in-flight [VmController::start]. Idempotent; a no-op
    /// when nothing is in flight. The cancelled start itself guarantees that the VM
    /// lands in `Stopped` with every partial acquisition released.
    pub fn cancel_operation(&self) {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            tracing::debug!(vm = %self.uuid, "cancelling the in-flight start");
            token.cancel();
        }
    }

    /// Swap the medium of an external drive, or eject it with `None`. The replacement
    /// location is scope-acquired before configuration or registry are touched, so a
    /// denied acquisition changes nothing; the previous medium's holder is released
    /// afterwards.
    pub fn change_medium(&self, drive_id: &str, path: Option<PathBuf>) -> Result<(), VmError> {
        let running = self.state() != VmState::Stopped;

        let mut configuration = self.configuration.lock().unwrap();
        let index = configuration
            .drives
            .iter()
            .position(|drive| drive.drive_id == drive_id)
            .ok_or_else(|| VmError::UnknownDrive(drive_id.to_owned()))?;

        if !configuration.drives[index].external {
            return Err(VmError::DriveNotExternal(drive_id.to_owned()));
        }

        let old_path = configuration.drives[index].path_on_host.clone();
        let read_only = configuration.drives[index].read_only;

        match path {
            Some(new_path) => {
                let resource = self.tracker.acquire(&new_path)?;
                configuration.drives[index].path_on_host = Some(new_path.clone());
                drop(configuration);

                self.store.update(self.uuid, |entry| {
                    entry
                        .external_drives
                        .insert(drive_id.to_owned(), FileRef::new(&new_path, read_only));
                });

                if running {
                    if let Some(old_path) = old_path {
                        self.release_one_held(old_path);
                    }
                    self.held.lock().unwrap().push(resource);
                }
                // When not running, the probe acquisition is dropped here and only the
                // minted bookmark survives.
            }
            None => {
                configuration.drives[index].path_on_host = None;
                drop(configuration);

                self.store.update(self.uuid, |entry| {
                    entry.external_drives.remove(drive_id);
                });

                if running {
                    if let Some(old_path) = old_path {
                        self.release_one_held(old_path);
                    }
                }
            }
        }

        self.emit(VmEvent::ConfigurationChanged);
        self.emit(VmEvent::RegistryChanged);
        Ok(())
    }

    /// Share a host directory with the guest. Same acquisition discipline as
    /// [VmController::change_medium].
    pub fn add_shared_directory(&self, path: impl Into<PathBuf>, read_only: bool) -> Result<(), VmError> {
        let path = path.into();
        let running = self.state() != VmState::Stopped;

        let resource = self.tracker.acquire(&path)?;

        self.configuration
            .lock()
            .unwrap()
            .shared_directories
            .push(SharedDirectory::new(&path, read_only));

        self.store.update(self.uuid, |entry| {
            entry.shared_directories.push(FileRef::new(&path, read_only));
        });

        if running {
            self.held.lock().unwrap().push(resource);
        }

        self.emit(VmEvent::ConfigurationChanged);
        self.emit(VmEvent::RegistryChanged);
        Ok(())
    }

    /// Stop sharing the directory at the given configuration index.
    pub fn remove_shared_directory(&self, index: usize) -> Result<(), VmError> {
        let running = self.state() != VmState::Stopped;

        let mut configuration = self.configuration.lock().unwrap();
        if index >= configuration.shared_directories.len() {
            return Err(VmError::UnknownSharedDirectory(index));
        }

        let removed = configuration.shared_directories.remove(index);
        drop(configuration);

        self.store.update(self.uuid, |entry| {
            if index < entry.shared_directories.len() {
                entry.shared_directories.remove(index);
            }
        });

        if running {
            self.release_one_held(removed.path);
        }

        self.emit(VmEvent::ConfigurationChanged);
        self.emit(VmEvent::RegistryChanged);
        Ok(())
    }

    /// Record window layout for a display index. Persisted via the debounced registry
    /// commit, so frequent frame updates amortize into infrequent writes.
    pub fn set_window_state(&self, display_index: u32, window: WindowState) {
        self.store.update(self.uuid, |entry| {
            entry.window_settings.insert(display_index, window);
        });
        self.emit(VmEvent::RegistryChanged);
    }

    /// Pull the externally referenced locations from the current configuration into the
    /// registry entry. Called after every successful configuration save.
    pub fn update_registry_from_config(&self) {
        let configuration = self.configuration.lock().unwrap().clone();
        self.store
            .update(self.uuid, |entry| entry.update_from_config(&configuration));
        self.emit(VmEvent::RegistryChanged);
    }

    /// Push registry-held locations back into the in-memory configuration view, used
    /// when registry changes need reflecting without a configuration rewrite.
    pub fn update_config_from_registry(&self) {
        if let Some(entry) = self.store.entry(self.uuid) {
            entry.write_to_config(&mut self.configuration.lock().unwrap());
            self.emit(VmEvent::ConfigurationChanged);
        }
    }

    fn ensure_snapshot_supported(&self) -> Result<(), VmError> {
        let configuration = self.configuration.lock().unwrap();
        snapshot_support(self.backend.capabilities(), &configuration).map_err(VmError::SnapshotUnsupported)
    }

    fn ensure_paused_or_running(&self) -> Result<(), VmError> {
        let actual = self.state();
        if actual != VmState::Started && actual != VmState::Paused {
            Err(VmError::ExpectedPausedOrRunning { actual })
        } else {
            Ok(())
        }
    }

    fn ensure_settled(&self) -> Result<(), VmError> {
        let actual = self.state();
        if actual.is_settled() {
            Ok(())
        } else {
            Err(VmError::OperationInFlight { actual })
        }
    }

    /// Claim a transition out of the one expected state, returning the session epoch
    /// the operation runs under.
    fn try_begin(&self, expected: VmState, next: VmState) -> Result<u64, VmError> {
        let epoch = {
            let mut state = self.state.lock().unwrap();
            if *state != expected {
                return Err(VmError::ExpectedState {
                    expected,
                    actual: *state,
                });
            }
            *state = next;
            self.session.load(Ordering::Relaxed)
        };

        tracing::debug!(vm = %self.uuid, state = %next, "lifecycle transition");
        self.emit(VmEvent::StateChanged(next));
        Ok(epoch)
    }

    fn try_begin_paused_or_running(&self, next: VmState) -> Result<(VmState, u64), VmError> {
        let (prior, epoch) = {
            let mut state = self.state.lock().unwrap();
            if *state != VmState::Started && *state != VmState::Paused {
                return Err(VmError::ExpectedPausedOrRunning { actual: *state });
            }
            let prior = *state;
            *state = next;
            (prior, self.session.load(Ordering::Relaxed))
        };

        tracing::debug!(vm = %self.uuid, state = %next, "lifecycle transition");
        self.emit(VmEvent::StateChanged(next));
        Ok((prior, epoch))
    }

    /// Complete an in-flight transition, but only if the session epoch it began under
    /// still owns the state machine. A kill that tore the session down in the meantime
    /// has already moved the state on, and the stale completion backs off.
    fn finish_transition(&self, epoch: u64, from: VmState, to: VmState) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != from || self.session.load(Ordering::Relaxed) != epoch {
                return false;
            }
            *state = to;
        }

        tracing::debug!(vm = %self.uuid, state = %to, "lifecycle transition");
        self.emit(VmEvent::StateChanged(to));
        true
    }

    fn owns_session(&self, epoch: u64, from: VmState) -> bool {
        let state = self.state.lock().unwrap();
        *state == from && self.session.load(Ordering::Relaxed) == epoch
    }

    /// Commit a successful start: the acquisitions move into the session-held table
    /// and the state settles to `Started`. When a concurrent kill superseded the
    /// session, the acquisitions unwind right here instead.
    fn finish_start(&self, epoch: u64, acquired: Vec<ScopedResource>) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != VmState::Starting || self.session.load(Ordering::Relaxed) != epoch {
                return false;
            }
            self.held.lock().unwrap().extend(acquired);
            *state = VmState::Started;
        }

        tracing::debug!(vm = %self.uuid, state = %VmState::Started, "lifecycle transition");
        self.emit(VmEvent::StateChanged(VmState::Started));
        true
    }

    /// Unwind a failed start, draining everything the session holds, unless a
    /// concurrent kill already tore it down. The drained holders are returned for
    /// release outside the state lock.
    fn abort_start(&self, epoch: u64) -> Option<Vec<ScopedResource>> {
        let held = {
            let mut state = self.state.lock().unwrap();
            if *state != VmState::Starting || self.session.load(Ordering::Relaxed) != epoch {
                return None;
            }
            let held = std::mem::take(&mut *self.held.lock().unwrap());
            *state = VmState::Stopped;
            self.session.fetch_add(1, Ordering::Relaxed);
            held
        };

        tracing::debug!(vm = %self.uuid, state = %VmState::Stopped, "lifecycle transition");
        self.emit(VmEvent::StateChanged(VmState::Stopped));
        Some(held)
    }

    fn try_begin_not_stopped(&self, next: VmState) -> Result<(), VmError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == VmState::Stopped {
                return Err(VmError::ExpectedNotStopped);
            }
            *state = next;
        }

        tracing::debug!(vm = %self.uuid, state = %next, "lifecycle transition");
        self.emit(VmEvent::StateChanged(next));
        Ok(())
    }

    fn set_state(&self, next: VmState) {
        {
            let mut state = self.state.lock().unwrap();
            *state = next;
            if next == VmState::Stopped {
                self.session.fetch_add(1, Ordering::Relaxed);
            }
        }

        tracing::debug!(vm = %self.uuid, state = %next, "lifecycle transition");
        self.emit(VmEvent::StateChanged(next));
    }

    fn emit(&self, event: VmEvent) {
        let _ = self.events.send(event);
    }

    async fn fail_session(&self) {
        self.kill_backend_best_effort().await;
        self.teardown_session();
    }

    fn teardown_session(&self) {
        self.disarm_status_task();
        self.release_all_held();
        self.store.update(self.uuid, |entry| entry.clear_remote_bookmarks());
        self.emit(VmEvent::RegistryChanged);
        self.set_state(VmState::Stopped);
    }

    async fn kill_backend_best_effort(&self) {
        if let Err(err) = self.backend.stop(StopMethod::Kill).await {
            tracing::warn!(vm = %self.uuid, error = %err, "best-effort backend kill failed");
        }
    }

    fn release_all_held(&self) {
        let held: Vec<ScopedResource> = std::mem::take(&mut *self.held.lock().unwrap());
        for resource in held {
            resource.release();
        }
    }

    fn release_one_held(&self, url: impl Into<PathBuf>) {
        let url = canonical_url(url.into());
        let mut held = self.held.lock().unwrap();

        if let Some(position) = held.iter().position(|resource| resource.url() == url) {
            held.remove(position).release();
        }
    }

    fn arm_status_task(&self) {
        if !self.backend.capabilities().supports_screenshots {
            return;
        }

        let backend = self.backend.clone();
        let uuid = self.uuid;
        let interval = self.screenshot_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if let Err(err) = backend.take_screenshot().await {
                    tracing::debug!(vm = %uuid, error = %err, "periodic screenshot failed");
                }
            }
        });

        *self.status_task.lock().unwrap() = Some(handle);
    }

    fn disarm_status_task(&self) {
        if let Some(handle) = self.status_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for VmController {
    fn drop(&mut self) {
        self.disarm_status_task();
    }
}

impl std::fmt::Debug for VmController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmController")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .finish()
    }
}
