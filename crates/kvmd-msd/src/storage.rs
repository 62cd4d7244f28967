//! Storage tree model: recursive image enumeration under the MSD root,
//! with every crossed mount point surfacing as a partition entity.
//!
//! Completeness of an image is the absence of a `.__<name>.incomplete`
//! sidecar next to it. An image is "adopted" when it lives outside the
//! root or on a foreign mount under it; adopted images never trigger
//! remounts and are only removable if their directory is writable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::remount::Remounter;
use crate::MsdError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInfo {
    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub in_storage: bool,
    pub complete: bool,
    pub removable: bool,
    pub size: u64,
    pub mod_ts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartInfo {
    #[serde(skip)]
    pub name: String,
    pub size: u64,
    pub free: u64,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct StorageState {
    pub size: u64,
    pub free: u64,
    pub images: BTreeMap<String, ImageInfo>,
    pub parts: BTreeMap<String, PartInfo>,
}

pub struct Storage {
    root: PathBuf,
    remounter: Remounter,
    watchable: Vec<PathBuf>,
    state: StorageState,
}

impl Storage {
    pub fn new(root: PathBuf, remounter: Remounter) -> Self {
        Self {
            root,
            remounter,
            watchable: Vec::new(),
            state: StorageState::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> &StorageState {
        &self.state
    }

    pub fn watchable_paths(&self) -> Vec<PathBuf> {
        self.watchable.clone()
    }

    pub fn image(&self, name: &str) -> Option<&ImageInfo> {
        self.state.images.get(name)
    }

    /// Full rescan. Runs blocking filesystem traversal, call via
    /// `spawn_blocking`.
    pub fn reload(&mut self) -> Result<(), MsdError> {
        let mut watchable = Vec::new();
        let mut images = BTreeMap::new();
        let mut parts = BTreeMap::new();

        let mut stack = vec![self.root.clone()];
        let mut dirs: Vec<(PathBuf, bool)> = Vec::new();
        while let Some(dir) = stack.pop() {
            let is_part = dir == self.root || is_mount_point(&dir);
            dirs.push((dir.clone(), is_part));
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    return Err(MsdError::Internal(format!(
                        "can't scan storage dir {}: {err}",
                        dir.display()
                    )))
                }
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let name = file_name.to_string_lossy();
                if name.starts_with('.') || name == "lost+found" {
                    continue;
                }
                let path = entry.path();
                match entry.file_type() {
                    Ok(ft) if ft.is_dir() => stack.push(path),
                    Ok(ft) if ft.is_file() => {
                        let rel = self.relative_name(&path);
                        if let Some(image) = self.probe_image(&rel, &path, true) {
                            images.insert(rel, image);
                        }
                    }
                    _ => {}
                }
            }
        }

        for (dir, is_part) in dirs {
            watchable.push(dir.clone());
            if is_part {
                let name = if dir == self.root {
                    String::new()
                } else {
                    self.relative_name(&dir)
                };
                if let Some(part) = probe_part(&name, &dir) {
                    parts.insert(name, part);
                }
            }
        }

        let (size, free) = parts
            .get("")
            .map(|root: &PartInfo| (root.size, root.free))
            .unwrap_or((0, 0));

        self.watchable = watchable;
        self.state = StorageState {
            size,
            free,
            images,
            parts,
        };
        Ok(())
    }

    /// Refreshes only the partition statistics (used once per second
    /// during long writes).
    pub fn reload_parts(&mut self) {
        let keys: Vec<String> = self.state.parts.keys().cloned().collect();
        for name in keys {
            let dir = if name.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&name)
            };
            if let Some(part) = probe_part(&name, &dir) {
                self.state.parts.insert(name, part);
            }
        }
    }

    pub fn make_image_by_name(&self, name: &str) -> Option<ImageInfo> {
        let path = self.root.join(name);
        self.probe_image(name, &path, true)
    }

    /// Resolves an arbitrary LUN path back to an image entity; paths
    /// outside the root become adopted images named by their basename.
    pub fn make_image_by_path(&self, path: &Path) -> Option<ImageInfo> {
        if let Ok(rel) = path.strip_prefix(&self.root) {
            let name = rel.to_string_lossy().into_owned();
            self.probe_image(&name, path, true)
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.probe_image(&name, path, false)
        }
    }

    fn probe_image(&self, name: &str, path: &Path, in_storage: bool) -> Option<ImageInfo> {
        if name.is_empty() {
            return None;
        }
        let adopted = !in_storage || self.is_adopted(path);
        let complete = if in_storage {
            !incomplete_marker_path(path).exists()
        } else {
            true
        };
        let dir_writable = path
            .parent()
            .map(|dir| is_writable(dir))
            .unwrap_or(false);
        let removable = in_storage && (!adopted || dir_writable);
        let (size, mod_ts) = match std::fs::metadata(path) {
            Ok(meta) => {
                let mod_ts = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                (meta.len(), mod_ts)
            }
            Err(_) => (0, 0.0),
        };
        Some(ImageInfo {
            name: name.to_owned(),
            path: path.to_owned(),
            in_storage,
            complete,
            removable,
            size,
            mod_ts,
        })
    }

    /// True when the image sits on a different mount than the root.
    pub fn is_adopted(&self, path: &Path) -> bool {
        let mut cursor = path.to_path_buf();
        while !is_mount_point(&cursor) {
            match cursor.parent() {
                Some(parent) => cursor = parent.to_path_buf(),
                None => break,
            }
        }
        cursor != self.root && !self.root.starts_with(&cursor)
    }

    fn relative_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|rel| rel.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string_lossy().into_owned())
    }

    pub async fn remount_rw(&self, rw: bool) -> Result<(), MsdError> {
        self.remounter.remount(rw).await
    }

    pub async fn remount_rw_unchecked(&self, rw: bool) {
        if let Err(err) = self.remounter.remount(rw).await {
            tracing::error!(%err, rw, "MSD remount failed");
        }
    }
}

pub fn incomplete_marker_path(image_path: &Path) -> PathBuf {
    let dir = image_path.parent().unwrap_or(Path::new(""));
    let file = image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!(".__{file}.incomplete"))
}

pub async fn set_complete(image_path: &Path, complete: bool) -> Result<(), MsdError> {
    let marker = incomplete_marker_path(image_path);
    if complete {
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MsdError::Internal(format!(
                "can't remove incomplete marker: {err}"
            ))),
        }
    } else {
        tokio::fs::File::create(&marker)
            .await
            .map(|_| ())
            .map_err(|err| MsdError::Internal(format!("can't create incomplete marker: {err}")))
    }
}

fn is_mount_point(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }
    let Some(parent) = path.parent() else {
        return true; // "/"
    };
    match std::fs::metadata(parent) {
        Ok(parent_meta) => {
            use std::os::unix::fs::MetadataExt;
            meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino()
        }
        Err(_) => false,
    }
}

fn is_writable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok()
}

fn probe_part(name: &str, dir: &Path) -> Option<PartInfo> {
    let stat = nix::sys::statvfs::statvfs(dir).ok()?;
    let writable = if name.is_empty() {
        true
    } else {
        is_writable(dir)
    };
    Some(PartInfo {
        name: name.to_owned(),
        size: stat.blocks() as u64 * stat.fragment_size() as u64,
        free: stat.blocks_available() as u64 * stat.fragment_size() as u64,
        writable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remount::Remounter;

    fn make_storage(root: &Path) -> Storage {
        Storage::new(root.to_path_buf(), Remounter::disabled())
    }

    #[tokio::test]
    async fn sidecar_marker_controls_completeness() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("test.iso");
        std::fs::write(&image, b"data").unwrap();

        set_complete(&image, false).await.unwrap();
        assert!(incomplete_marker_path(&image).exists());
        set_complete(&image, true).await.unwrap();
        assert!(!incomplete_marker_path(&image).exists());
        assert!(image.exists());
        // Idempotent on a missing marker.
        set_complete(&image, true).await.unwrap();
    }

    #[test]
    fn reload_finds_images_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.iso"), b"aaaa").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.img"), b"bb").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("lost+found")).unwrap();
        std::fs::write(dir.path().join("lost+found/junk"), b"x").unwrap();

        let mut storage = make_storage(dir.path());
        storage.reload().unwrap();
        let state = storage.state();
        assert!(state.images.contains_key("a.iso"));
        assert!(state.images.contains_key("nested/b.img"));
        assert_eq!(state.images.len(), 2);
        assert!(state.parts.contains_key(""));
        assert_eq!(state.images["a.iso"].size, 4);
        assert!(state.images["a.iso"].complete);
    }

    #[test]
    fn incomplete_sidecar_marks_image() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("up.iso"), b"half").unwrap();
        std::fs::write(dir.path().join(".__up.iso.incomplete"), b"").unwrap();
        let mut storage = make_storage(dir.path());
        storage.reload().unwrap();
        assert!(!storage.state().images["up.iso"].complete);
    }

    #[test]
    fn image_by_path_outside_root_is_not_in_storage() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let foreign = other.path().join("foreign.iso");
        std::fs::write(&foreign, b"x").unwrap();
        let storage = make_storage(dir.path());
        let image = storage.make_image_by_path(&foreign).unwrap();
        assert!(!image.in_storage);
        assert_eq!(image.name, "foreign.iso");
    }
}
