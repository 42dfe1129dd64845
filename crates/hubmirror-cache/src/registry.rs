//! Process-wide registry of open block containers.
//!
//! Concurrent requests for the same resource share one [`BlockFile`]
//! handle, and the disk reaper consults the registry so it never deletes
//! a container a request still holds open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::block_file::{BlockFile, CacheFileError, WeakBlockFile};
use crate::paths::make_parent_dirs;

#[derive(Clone, Default)]
pub struct ContainerRegistry {
    inner: Arc<Mutex<HashMap<PathBuf, WeakBlockFile>>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, WeakBlockFile>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the shared handle for `path`, opening (or creating) the
    /// container when no live handle exists.
    pub async fn open_or_create(
        &self,
        path: &Path,
        block_size_hint: u64,
    ) -> Result<BlockFile, CacheFileError> {
        if let Some(file) = self.get_live(path) {
            return Ok(file);
        }
        make_parent_dirs(path)?;
        let open_path = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || BlockFile::open(open_path, block_size_hint))
            .await
            .map_err(|err| CacheFileError::Io(std::io::Error::other(err)))??;

        let mut map = self.lock();
        map.retain(|_, weak| weak.upgrade().is_some());
        // Another request may have opened the same container while we
        // were off the lock; prefer the registered handle so all writers
        // share one mask.
        if let Some(existing) = map.get(path).and_then(WeakBlockFile::upgrade) {
            return Ok(existing);
        }
        map.insert(path.to_path_buf(), file.downgrade());
        Ok(file)
    }

    fn get_live(&self, path: &Path) -> Option<BlockFile> {
        self.lock().get(path).and_then(WeakBlockFile::upgrade)
    }

    /// Whether some request currently holds the container at `path`.
    pub fn is_live(&self, path: &Path) -> bool {
        self.get_live(path).is_some()
    }
}
