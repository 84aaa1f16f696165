//! Durable label → bytes storage behind the root material. The platform
//! shell supplies its own implementation; the file store covers desktop
//! installs and the memory store covers tests.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::CaError;

/// Durable across restarts and atomic per key.
pub trait KeyStore: Send + Sync {
    fn get(&self, label: &str) -> Result<Option<Vec<u8>>, CaError>;
    fn put(&self, label: &str, bytes: &[u8]) -> Result<(), CaError>;
    fn delete(&self, label: &str) -> Result<(), CaError>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, label: &str) -> Result<Option<Vec<u8>>, CaError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| CaError::KeystoreUnavailable("keystore lock poisoned".to_string()))?
            .get(label)
            .cloned())
    }

    fn put(&self, label: &str, bytes: &[u8]) -> Result<(), CaError> {
        self.entries
            .lock()
            .map_err(|_| CaError::KeystoreUnavailable("keystore lock poisoned".to_string()))?
            .insert(label.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, label: &str) -> Result<(), CaError> {
        self.entries
            .lock()
            .map_err(|_| CaError::KeystoreUnavailable("keystore lock poisoned".to_string()))?
            .remove(label);
        Ok(())
    }
}

/// One file per label under a directory; writes go through a temp file and
/// a rename so a crash never leaves a half-written key.
#[derive(Debug)]
pub struct FileKeyStore {
    directory: PathBuf,
}

impl FileKeyStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, CaError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .map_err(|error| CaError::KeystoreUnavailable(error.to_string()))?;
        Ok(Self { directory })
    }

    fn path_for(&self, label: &str) -> PathBuf {
        // Labels are fixed identifiers; escape anything path-hostile anyway.
        let safe: String = label
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.directory.join(safe)
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, label: &str) -> Result<Option<Vec<u8>>, CaError> {
        match std::fs::read(self.path_for(label)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(CaError::KeystoreUnavailable(error.to_string())),
        }
    }

    fn put(&self, label: &str, bytes: &[u8]) -> Result<(), CaError> {
        let target = self.path_for(label);
        let staging = target.with_extension("tmp");

        let mut file = std::fs::File::create(&staging)
            .map_err(|error| CaError::KeystoreUnavailable(error.to_string()))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|error| CaError::KeystoreUnavailable(error.to_string()))?;
        drop(file);

        std::fs::rename(&staging, &target)
            .map_err(|error| CaError::KeystoreUnavailable(error.to_string()))
    }

    fn delete(&self, label: &str) -> Result<(), CaError> {
        match std::fs::remove_file(self.path_for(label)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(CaError::KeystoreUnavailable(error.to_string())),
        }
    }
}
