use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use uuid::Uuid;

use super::RegistryEntry;

/// The default coalescing window for debounced commits.
pub const DEFAULT_COMMIT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("An I/O operation against the registry document failed: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("Serde serialization or deserialization of the registry document failed: `{0}`")]
    Serde(#[from] serde_json::Error),
}

/// What to do when an adopted entry carries a UUID that already belongs to a different
/// package on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Treat the existing row as stale and overwrite it; the first stale match wins.
    #[default]
    ReplaceStale,
    /// Keep the existing row and give the incoming entry a freshly generated UUID.
    RegenerateNew,
}

struct StoreState {
    path: PathBuf,
    window: Duration,
    entries: Mutex<HashMap<Uuid, RegistryEntry>>,
    commit_scheduled: AtomicBool,
    commits: AtomicU64,
}

/// Durable, debounced persistence of every [RegistryEntry], keyed by VM UUID.
///
/// Any mutation marks the store dirty and schedules a commit after the coalescing
/// window elapses, so frequent small updates (window frames, drive swaps) amortize
/// into infrequent whole-document writes. Commit scheduling runs on its own task and
/// never blocks a lifecycle operation. [RegistryStore::flush] is the synchronous final
/// commit for process termination.
#[derive(Clone)]
pub struct RegistryStore {
    state: Arc<StoreState>,
}

impl RegistryStore {
    /// Open the registry document at the given path with the default commit window,
    /// leniently loading whatever records decode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        Self::open_with_window(path, DEFAULT_COMMIT_WINDOW)
    }

    pub fn open_with_window(path: impl Into<PathBuf>, window: Duration) -> Result<Self, RegistryError> {
        let path = path.into();
        let entries = load_lenient(&path)?;

        Ok(Self {
            state: Arc::new(StoreState {
                path,
                window,
                entries: Mutex::new(entries),
                commit_scheduled: AtomicBool::new(false),
                commits: AtomicU64::new(0),
            }),
        })
    }

    pub fn entry(&self, uuid: Uuid) -> Option<RegistryEntry> {
        self.state.entries.lock().unwrap().get(&uuid).cloned()
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.state.entries.lock().unwrap().contains_key(&uuid)
    }

    pub fn len(&self) -> usize {
        self.state.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.lock().unwrap().is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.state.entries.lock().unwrap().keys().copied().collect()
    }

    /// Fetch the entry for a VM, lazily creating it on first reference.
    pub fn entry_or_insert_with(&self, uuid: Uuid, default: impl FnOnce() -> RegistryEntry) -> RegistryEntry {
        let entry = self
            .state
            .entries
            .lock()
            .unwrap()
            .entry(uuid)
            .or_insert_with(default)
            .clone();
        self.mark_dirty();
        entry
    }

    /// Mutate the entry for a VM in place, scheduling a debounced commit. Returns false
    /// without calling the closure if no entry exists for the UUID.
    pub fn update(&self, uuid: Uuid, mutate: impl FnOnce(&mut RegistryEntry)) -> bool {
        let updated = match self.state.entries.lock().unwrap().get_mut(&uuid) {
            Some(entry) => {
                mutate(entry);
                true
            }
            None => false,
        };

        if updated {
            self.mark_dirty();
        }

        updated
    }

    /// Insert or overwrite an entry unconditionally.
    pub fn insert(&self, entry: RegistryEntry) {
        self.state.entries.lock().unwrap().insert(entry.uuid, entry);
        self.mark_dirty();
    }

    /// Adopt an entry whose UUID may collide with an existing row for a different
    /// package, applying the given [DuplicatePolicy]. Returns the UUID the entry ended
    /// up stored under.
    pub fn adopt(&self, mut entry: RegistryEntry, policy: DuplicatePolicy) -> Uuid {
        let mut entries = self.state.entries.lock().unwrap();

        let collides = entries
            .get(&entry.uuid)
            .is_some_and(|existing| existing.package.path != entry.package.path);

        if collides && policy == DuplicatePolicy::RegenerateNew {
            let regenerated = Uuid::new_v4();
            tracing::warn!(original = %entry.uuid, regenerated = %regenerated, "duplicate VM UUID, regenerating");
            entry.uuid = regenerated;
        }

        let uuid = entry.uuid;
        entries.insert(uuid, entry);
        drop(entries);

        self.mark_dirty();
        uuid
    }

    pub fn remove(&self, uuid: Uuid) -> Option<RegistryEntry> {
        let removed = self.state.entries.lock().unwrap().remove(&uuid);

        if removed.is_some() {
            self.mark_dirty();
        }

        removed
    }

    /// Remove every entry whose UUID is not in the given set. Used after a directory
    /// rescan to drop rows for VMs no longer present on disk.
    pub fn prune(&self, except: &HashSet<Uuid>) {
        let mut entries = self.state.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|uuid, _| except.contains(uuid));
        let pruned = before - entries.len();
        drop(entries);

        if pruned > 0 {
            tracing::debug!(pruned, "pruned registry entries");
            self.mark_dirty();
        }
    }

    /// Commit synchronously, regardless of any pending debounced commit. Intended for
    /// process termination.
    pub fn flush(&self) -> Result<(), RegistryError> {
        self.state.commit()
    }

    /// How many commits (debounced or flushed) have hit durable storage.
    pub fn commit_count(&self) -> u64 {
        self.state.commits.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        if self.state.commit_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let state = self.state.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(state.window).await;
                    state.commit_scheduled.store(false, Ordering::Release);

                    if let Err(err) = state.commit() {
                        tracing::error!(error = %err, "debounced registry commit failed");
                    }
                });
            }
            Err(_) => {
                // Outside a runtime there is nothing to debounce against; the mutation
                // stays in memory until an explicit flush.
                self.state.commit_scheduled.store(false, Ordering::Release);
            }
        }
    }
}

impl StoreState {
    fn commit(&self) -> Result<(), RegistryError> {
        let serialized = {
            let entries = self.entries.lock().unwrap();
            let document: HashMap<String, &RegistryEntry> =
                entries.iter().map(|(uuid, entry)| (uuid.to_string(), entry)).collect();
            serde_json::to_string_pretty(&document)?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let staging_path = self.path.with_extension("staging");
        std::fs::write(&staging_path, serialized)?;
        std::fs::rename(&staging_path, &self.path)?;

        self.commits.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(path = %self.path.display(), "committed registry document");
        Ok(())
    }
}

fn load_lenient(path: &PathBuf) -> Result<HashMap<Uuid, RegistryEntry>, RegistryError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err.into()),
    };

    let document: HashMap<String, serde_json::Value> = serde_json::from_str(&raw)?;
    let mut entries = HashMap::with_capacity(document.len());

    for (key, value) in document {
        let Ok(uuid) = key.parse::<Uuid>() else {
            tracing::warn!(key = %key, "dropping registry record with a non-UUID key");
            continue;
        };

        match serde_json::from_value::<RegistryEntry>(value) {
            Ok(mut entry) => {
                entry.uuid = uuid;
                entry.drop_invalid_files();
                entries.insert(uuid, entry);
            }
            Err(err) => {
                tracing::warn!(%uuid, error = %err, "dropping undecodable registry record");
            }
        }
    }

    Ok(entries)
}
