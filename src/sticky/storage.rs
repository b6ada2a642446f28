//! Raw persistence primitives the sticky store writes through to.
use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

/// Key-value persistence of whole documents.
///
/// Implementations may fail with any I/O error; the sticky store catches and logs all of them.
/// A missing key is not an error: `load` returns `Ok(None)` and `delete` succeeds.
pub trait DurableStorage: Send {
    #[allow(missing_docs)]
    fn load(&self, key: &str) -> io::Result<Option<String>>;
    #[allow(missing_docs)]
    fn save(&self, key: &str, value: &str) -> io::Result<()>;
    #[allow(missing_docs)]
    fn delete(&self, key: &str) -> io::Result<()>;
}

impl<T: DurableStorage + Sync> DurableStorage for Arc<T> {
    fn load(&self, key: &str) -> io::Result<Option<String>> {
        (**self).load(key)
    }

    fn save(&self, key: &str, value: &str) -> io::Result<()> {
        (**self).save(key, value)
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        (**self).delete(key)
    }
}

/// Stores every key as a file in one directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash mid-write leaves
/// either the old or the new document on disk, never a truncated one.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create storage rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> FileStorage {
        FileStorage { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl DurableStorage for FileStorage {
    fn load(&self, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save(&self, key: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let target = self.path(key);
        let tmp = self.path(&format!("{key}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path(key)) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }
}

/// In-process storage. Useful for tests and for hosts without a writable disk.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    #[allow(missing_docs)]
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    fn documents(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurableStorage for MemoryStorage {
    fn load(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.documents().get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> io::Result<()> {
        self.documents().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.documents().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DurableStorage, FileStorage, MemoryStorage};

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested"));

        assert_eq!(storage.load("doc.json").unwrap(), None);
        storage.save("doc.json", "{\"a\":1}").unwrap();
        assert_eq!(storage.load("doc.json").unwrap().as_deref(), Some("{\"a\":1}"));
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());

        storage.save("doc.json", "{}").unwrap();
        assert_eq!(storage.load("doc.json").unwrap().as_deref(), Some("{}"));

        storage.delete("doc.json").unwrap();
        assert_eq!(storage.load("doc.json").unwrap(), None);
        // Deleting a missing key is not an error.
        storage.delete("doc.json").unwrap();
    }

    #[test]
    fn file_storage_reports_unreadable_paths() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where a file is expected.
        std::fs::create_dir(dir.path().join("doc.json")).unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.load("doc.json").is_err());
    }

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        storage.save("k", "v").unwrap();
        assert_eq!(storage.load("k").unwrap().as_deref(), Some("v"));
        storage.delete("k").unwrap();
        assert_eq!(storage.load("k").unwrap(), None);
    }
}
