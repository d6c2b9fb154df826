//! File-system blob store.
//!
//! Each store is one directory; each blob is one regular file named by the
//! blob name. Blob names are expected to be filesystem-safe (key ids are
//! lowercase hex, session names are caller-controlled identifiers).

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use super::{BlobStore, BlobStoreProvider, StorageError};
use crate::identity::Identity;

/// Blob store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Open a store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl BlobStore for FileBlobStore {
    fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        // Write via a temp file and rename so a crash never leaves a
        // half-written blob under the final name.
        let tmp = self.root.join(format!("{name}.tmp"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.path(name))?;
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path(name)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Skip stragglers from interrupted writes.
                if !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { name: name.to_string() })
            },
            Err(err) => Err(err.into()),
        }
    }

    fn delete_all(&self) -> Result<(), StorageError> {
        for name in self.list()? {
            match self.delete(&name) {
                Ok(()) | Err(StorageError::NotFound { .. }) => {},
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Provider laying stores out as `<root>/<identity>/<category>/`.
#[derive(Debug, Clone)]
pub struct FileStoreProvider {
    root: PathBuf,
}

impl FileStoreProvider {
    /// Create a provider rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory this provider writes under.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStoreProvider for FileStoreProvider {
    type Store = FileBlobStore;

    fn open(&self, identity: &Identity, category: &str) -> Result<FileBlobStore, StorageError> {
        FileBlobStore::open(self.root.join(identity.as_str()).join(category))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();

        store.write("alpha", b"payload").unwrap();
        assert_eq!(store.read("alpha").unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();
        assert_eq!(store.read("missing").unwrap(), None);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();
        assert!(matches!(store.delete("missing"), Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn list_returns_sorted_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();

        store.write("bravo", b"2").unwrap();
        store.write("alpha", b"1").unwrap();

        assert_eq!(store.list().unwrap(), vec!["alpha".to_string(), "bravo".to_string()]);
    }

    #[test]
    fn delete_all_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();

        store.write("a", b"1").unwrap();
        store.write("b", b"2").unwrap();
        store.delete_all().unwrap();

        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn provider_scopes_by_identity_and_category() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileStoreProvider::new(dir.path());

        let alice = provider.open(&Identity::new("alice"), "sessions").unwrap();
        let bob = provider.open(&Identity::new("bob"), "sessions").unwrap();

        alice.write("peer", b"alice-data").unwrap();
        assert_eq!(bob.read("peer").unwrap(), None);
    }
}
