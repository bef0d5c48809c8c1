use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// The platform bracket around access to a file or directory outside the VM's own
/// managed storage. On sandboxed hosts this maps to a begin/end security-scoped access
/// pair; elsewhere it can be a no-op.
pub trait ScopedAccess: Send + Sync {
    fn begin(&self, url: &Path) -> Result<(), ResourceError>;

    fn end(&self, url: &Path);
}

/// A [ScopedAccess] implementation for hosts without access brokering: the bracket only
/// verifies that the location exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostScopedAccess;

impl ScopedAccess for HostScopedAccess {
    fn begin(&self, url: &Path) -> Result<(), ResourceError> {
        if url.exists() {
            Ok(())
        } else {
            Err(ResourceError::AccessDenied {
                url: url.to_path_buf(),
                reason: "the location does not exist".to_owned(),
            })
        }
    }

    fn end(&self, _url: &Path) {}
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Scoped access to `{url}` could not be started: {reason}")]
    AccessDenied { url: PathBuf, reason: String },
}

struct TrackerState {
    access: Box<dyn ScopedAccess>,
    refcounts: Mutex<HashMap<PathBuf, u64>>,
    next_id: AtomicU64,
}

/// The process-wide reference-count table for out-of-sandbox file and directory access,
/// shared by every controller.
///
/// Acquisition is keyed by canonicalized URL: the underlying [ScopedAccess::begin] call
/// is issued only on the 0-to-1 refcount edge and [ScopedAccess::end] only on the
/// 1-to-0 edge, so N holders of the same location share one OS-level bracket. All
/// refcount mutations funnel through one internal mutex.
#[derive(Clone)]
pub struct ResourceTracker {
    state: Arc<TrackerState>,
}

impl ResourceTracker {
    pub fn new(access: impl ScopedAccess + 'static) -> Self {
        Self {
            state: Arc::new(TrackerState {
                access: Box::new(access),
                refcounts: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A tracker backed by [HostScopedAccess].
    pub fn host() -> Self {
        Self::new(HostScopedAccess)
    }

    /// Acquire scoped access to the given location, returning a holder token that
    /// releases on [ScopedResource::release] or on drop, whichever comes first.
    pub fn acquire(&self, url: impl Into<PathBuf>) -> Result<ScopedResource, ResourceError> {
        let url = canonical_url(url.into());
        let mut refcounts = self.state.refcounts.lock().unwrap();
        let count = refcounts.entry(url.clone()).or_insert(0);

        if *count == 0 {
            if let Err(err) = self.state.access.begin(&url) {
                refcounts.remove(&url);
                return Err(err);
            }
        }

        *count += 1;
        tracing::debug!(url = %url.display(), refcount = *count, "acquired scoped resource");

        Ok(ScopedResource {
            id: self.state.next_id.fetch_add(1, Ordering::Relaxed),
            url,
            tracker: self.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// The current refcount for a location, 0 if untracked.
    pub fn refcount(&self, url: impl Into<PathBuf>) -> u64 {
        let url = canonical_url(url.into());
        self.state
            .refcounts
            .lock()
            .unwrap()
            .get(&url)
            .copied()
            .unwrap_or(0)
    }

    fn release_url(&self, url: &Path) {
        let mut refcounts = self.state.refcounts.lock().unwrap();

        match refcounts.get_mut(url) {
            Some(0) | None => {
                // Clamp instead of going negative: an unmatched release is a caller bug
                // worth logging but never worth crashing the host over.
                tracing::warn!(url = %url.display(), "release without a matching acquire, clamping at zero");
                refcounts.remove(url);
            }
            Some(count) => {
                *count -= 1;
                tracing::debug!(url = %url.display(), refcount = *count, "released scoped resource");

                if *count == 0 {
                    refcounts.remove(url);
                    self.state.access.end(url);
                }
            }
        }
    }
}

/// A capability token representing one holder's scoped access to an external location.
///
/// Release is idempotent per holder: calling [ScopedResource::release] twice, or
/// releasing and then dropping, decrements the shared refcount exactly once.
pub struct ScopedResource {
    id: u64,
    url: PathBuf,
    tracker: ResourceTracker,
    released: AtomicBool,
}

impl ScopedResource {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The canonicalized location this token grants access to.
    pub fn url(&self) -> &Path {
        &self.url
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.tracker.release_url(&self.url);
        }
    }
}

impl Drop for ScopedResource {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ScopedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedResource")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish()
    }
}

pub(crate) fn canonical_url(url: PathBuf) -> PathBuf {
    std::fs::canonicalize(&url).unwrap_or(url)
}
