use async_trait::async_trait;

/// A method of stopping a running VM, ordered from most graceful to most forceful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StopMethod {
    /// Ask the guest OS to shut itself down. The backend reports the actual exit later,
    /// so issuing a request does not by itself change the VM's lifecycle state.
    Request,
    /// Tear down the backend session without involving the guest.
    Force,
    /// Terminate the underlying engine outright. Always available as an escape hatch.
    Kill,
}

impl std::fmt::Display for StopMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopMethod::Request => write!(f, "request"),
            StopMethod::Force => write!(f, "force"),
            StopMethod::Kill => write!(f, "kill"),
        }
    }
}

/// Static capability flags describing what a [Backend] kind can do. Queried once and
/// used to gate operations before they ever reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub supports_snapshots: bool,
    pub supports_process_kill: bool,
    pub supports_screenshots: bool,
    pub supports_disposable_mode: bool,
    pub supports_recovery_mode: bool,
    pub supports_remote_session: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("The underlying engine process failed: `{0}`")]
    Process(String),
    #[error("The engine rejected the operation: `{0}`")]
    Rejected(String),
    #[error("The operation is not implemented by this backend: {0}")]
    Unsupported(&'static str),
    #[error("An I/O operation against the engine failed: `{0}`")]
    Io(#[from] std::io::Error),
}

/// Per-start options forwarded to the backend alongside the lifecycle decision-making
/// done by the controller itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartOptions {
    /// Boot cold even if a suspend snapshot exists for this VM.
    pub boot_fresh: bool,
    /// Boot into the platform's recovery environment, where supported.
    pub recovery: bool,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boot_fresh(mut self, boot_fresh: bool) -> Self {
        self.boot_fresh = boot_fresh;
        self
    }

    pub fn recovery(mut self, recovery: bool) -> Self {
        self.recovery = recovery;
        self
    }
}

/// The contract any execution engine (process-based emulator or native hypervisor)
/// must implement to be driven by a [VmController](crate::vm::VmController).
///
/// Every method is a suspension point for the controller's state machine: no lifecycle
/// transition is considered complete until the corresponding call here has resolved.
/// Implementations report failures via [BackendError] and must not retry internally.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The static capability flags for this backend kind.
    fn capabilities(&self) -> Capabilities;

    /// Whether this engine/architecture combination can run on the current host at all.
    /// Checked before any resource acquisition occurs.
    fn is_supported(&self) -> bool {
        true
    }

    async fn start(&self, options: &StartOptions) -> Result<(), BackendError>;

    async fn stop(&self, method: StopMethod) -> Result<(), BackendError>;

    async fn pause(&self) -> Result<(), BackendError>;

    async fn resume(&self) -> Result<(), BackendError>;

    async fn save_snapshot(&self, name: &str) -> Result<(), BackendError>;

    async fn restore_snapshot(&self, name: &str) -> Result<(), BackendError>;

    async fn delete_snapshot(&self, name: &str) -> Result<(), BackendError>;

    /// Grab a screenshot of the guest display, where supported. Driven periodically by
    /// the controller's status timer; failures are logged and never affect lifecycle.
    async fn take_screenshot(&self) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Unsupported("screenshots"))
    }
}
