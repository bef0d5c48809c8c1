//! The per-VM runtime registry: durable metadata that user configuration does not own,
//! either because it is host-specific (bookmarks), transient (window layout), or only
//! meaningful between boots (the suspend flag).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vm::configuration::VmConfigurationData;

pub mod store;

pub use store::{DuplicatePolicy, RegistryError, RegistryStore};

/// An opaque, durable reference to a filesystem location that can be resolved again
/// later, potentially after a process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark(Vec<u8>);

/// The outcome of resolving a [Bookmark]. A stale resolution still names the recorded
/// location, but callers should mint a replacement bookmark once the location is
/// reachable again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    pub stale: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BookmarkError {
    #[error("The bookmark data is empty or malformed and cannot name a location")]
    Malformed,
}

impl Bookmark {
    /// Mint a bookmark for the given location as it exists right now.
    pub fn mint(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self(canonical.to_string_lossy().into_owned().into_bytes())
    }

    pub fn resolve(&self) -> Result<Resolution, BookmarkError> {
        if self.0.is_empty() {
            return Err(BookmarkError::Malformed);
        }

        let path = PathBuf::from(String::from_utf8(self.0.clone()).map_err(|_| BookmarkError::Malformed)?);
        let stale = !path.exists();
        Ok(Resolution { path, stale })
    }
}

/// A registry-held reference to a file or directory: a durable [Bookmark] plus a plain
/// path mirror used whenever the bookmark cannot (yet) be resolved.
///
/// The remote bookmark exists only while a backend session is alive and needs
/// cross-process access to the same location; it is structurally excluded from
/// persistence and cleared whenever the VM reaches the stopped state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: PathBuf,
    #[serde(default)]
    pub bookmark: Option<Bookmark>,
    #[serde(skip)]
    pub remote_bookmark: Option<Bookmark>,
    #[serde(default)]
    pub read_only: bool,
}

impl FileRef {
    /// Reference a location, minting a durable bookmark for it.
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        let path = path.into();
        let bookmark = Some(Bookmark::mint(&path));
        Self {
            path,
            bookmark,
            remote_bookmark: None,
            read_only,
        }
    }

    /// Resolve the durable bookmark back to a path, refreshing the path mirror and
    /// transparently re-minting the bookmark when the resolution came back stale but
    /// the location is reachable again. Returns the current best-known path.
    pub fn resolve(&mut self) -> Result<&Path, BookmarkError> {
        if let Some(ref bookmark) = self.bookmark {
            let resolution = bookmark.resolve()?;
            self.path = resolution.path;

            if resolution.stale && self.path.exists() {
                self.bookmark = Some(Bookmark::mint(&self.path));
            }
        }

        Ok(&self.path)
    }

    /// Whether the durable bookmark (if any) still names a reachable location.
    pub fn is_valid(&self) -> bool {
        match self.bookmark {
            Some(ref bookmark) => matches!(bookmark.resolve(), Ok(Resolution { stale: false, .. })),
            None => true,
        }
    }
}

/// Window layout recorded per display index. Opaque to the lifecycle machinery and
/// persisted verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct WindowState {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub fullscreen: bool,
}

/// The mutable per-VM record of runtime metadata, keyed by the VM's immutable UUID.
///
/// Optional fields default on decode so that records written by newer versions still
/// load; only the mandatory identity fields (`uuid`, `name`, `package`, `suspended`)
/// can fail a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub uuid: Uuid,
    pub name: String,
    pub package: FileRef,
    pub suspended: bool,
    #[serde(default)]
    pub external_drives: HashMap<String, FileRef>,
    #[serde(default)]
    pub shared_directories: Vec<FileRef>,
    #[serde(default)]
    pub window_settings: HashMap<u32, WindowState>,
    #[serde(default)]
    pub migrated_config: bool,
}

impl RegistryEntry {
    pub fn new(uuid: Uuid, name: impl Into<String>, package: FileRef) -> Self {
        Self {
            uuid,
            name: name.into(),
            package,
            suspended: false,
            external_drives: HashMap::new(),
            shared_directories: Vec::new(),
            window_settings: HashMap::new(),
            migrated_config: false,
        }
    }

    /// Pull the externally referenced locations out of a configuration into this entry.
    ///
    /// External drives with a URL get a durable [FileRef] recorded (or refreshed) under
    /// their drive id; external drives without a URL and drive ids no longer present in
    /// the configuration are pruned. Shared directories are replaced wholesale, never
    /// merged.
    pub fn update_from_config(&mut self, configuration: &VmConfigurationData) {
        for drive in &configuration.drives {
            if !drive.external {
                continue;
            }

            match drive.path_on_host {
                Some(ref path) => {
                    let recorded = self
                        .external_drives
                        .get(&drive.drive_id)
                        .is_some_and(|file| file.path == *path && file.read_only == drive.read_only);

                    if !recorded {
                        self.external_drives
                            .insert(drive.drive_id.clone(), FileRef::new(path, drive.read_only));
                    }
                }
                None => {
                    self.external_drives.remove(&drive.drive_id);
                }
            }
        }

        let known_ids: Vec<String> = configuration.drives.iter().map(|drive| drive.drive_id.clone()).collect();
        self.external_drives.retain(|drive_id, _| known_ids.contains(drive_id));

        self.shared_directories = configuration
            .shared_directories
            .iter()
            .map(|share| FileRef::new(&share.path, share.read_only))
            .collect();
    }

    /// The inverse of [RegistryEntry::update_from_config]: push registry-held locations
    /// back into the in-memory configuration view without touching anything the
    /// registry does not own.
    pub fn write_to_config(&self, configuration: &mut VmConfigurationData) {
        for drive in &mut configuration.drives {
            if !drive.external {
                continue;
            }

            if let Some(file) = self.external_drives.get(&drive.drive_id) {
                drive.path_on_host = Some(file.path.clone());
            }
        }

        for (share, file) in configuration.shared_directories.iter_mut().zip(&self.shared_directories) {
            share.path = file.path.clone();
            share.read_only = file.read_only;
        }
    }

    /// Drop every session-scoped bookmark. Called whenever the VM reaches the stopped
    /// state, since remote bookmarks are only valid while a backend process is alive.
    pub fn clear_remote_bookmarks(&mut self) {
        self.package.remote_bookmark = None;

        for file in self.external_drives.values_mut() {
            file.remote_bookmark = None;
        }

        for file in &mut self.shared_directories {
            file.remote_bookmark = None;
        }
    }

    /// Drop recorded drives and shares whose durable bookmarks no longer resolve,
    /// rather than letting one dead location fail the whole record.
    pub(crate) fn drop_invalid_files(&mut self) {
        self.external_drives.retain(|drive_id, file| {
            let valid = file.is_valid();
            if !valid {
                tracing::warn!(drive_id = %drive_id, path = %file.path.display(), "dropping external drive with unresolvable bookmark");
            }
            valid
        });

        self.shared_directories.retain(|file| {
            let valid = file.is_valid();
            if !valid {
                tracing::warn!(path = %file.path.display(), "dropping shared directory with unresolvable bookmark");
            }
            valid
        });

        // The package reference itself is mandatory, so only its bookmark is shed and
        // the path mirror keeps working.
        if !self.package.is_valid() {
            tracing::warn!(path = %self.package.path.display(), "package bookmark is unresolvable, falling back to the path mirror");
            self.package.bookmark = None;
        }
    }
}
