//! File-based persistence adapter.
//!
//! Directory layout:
//!
//! ```text
//! <dir>/
//! ├─ LOCK              # Advisory lock, one reactor per directory
//! ├─ device-id         # One file per key
//! └─ pending-mutations
//! ```

use crate::adapter::PersistenceAdapter;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const TEMP_SUFFIX: &str = ".tmp";

/// A persistence adapter that keeps one file per key.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// target, so a crash leaves either the old or the new value.
///
/// The directory is locked exclusively for the lifetime of the store.
///
/// # Example
///
/// ```no_run
/// use tessera_storage::{FileStore, PersistenceAdapter};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("./tessera-state")).unwrap();
/// store.set_item("device-id", b"abc").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the
    /// directory, or an I/O error if it cannot be created.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        tracing::debug!(dir = %dir.display(), "[storage] opened file store");

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = |reason| {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    if key.is_empty() {
        return invalid("empty");
    }
    if key == LOCK_FILE || key.ends_with(TEMP_SUFFIX) {
        return invalid("reserved");
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("only ASCII letters, digits, '-', '_' and '.' are allowed");
    }
    if key.starts_with('.') {
        return invalid("must not start with '.'");
    }
    Ok(())
}

impl PersistenceAdapter for FileStore {
    fn get_item(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let temp = self.dir.join(format!("{key}{TEMP_SUFFIX}"));
        {
            let mut file = File::create(&temp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self._lock_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set_item("device-id", b"dev-1").unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get_item("device-id").unwrap(), Some(b"dev-1".to_vec()));
    }

    #[test]
    fn lock_prevents_second_open() {
        let dir = tempdir().unwrap();
        let _first = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            FileStore::open(dir.path()),
            Err(StorageError::Locked)
        ));
    }

    #[test]
    fn overwrite_and_remove() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set_item("k", b"one").unwrap();
        store.set_item("k", b"two").unwrap();
        assert_eq!(store.get_item("k").unwrap(), Some(b"two".to_vec()));

        store.remove_item("k").unwrap();
        store.remove_item("k").unwrap();
        assert_eq!(store.get_item("k").unwrap(), None);
    }

    #[test]
    fn rejects_unsafe_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for key in ["", "../escape", "a/b", "LOCK", "x.tmp", ".hidden"] {
            assert!(
                matches!(store.set_item(key, b"v"), Err(StorageError::InvalidKey { .. })),
                "{key:?} should be rejected"
            );
        }
    }
}
