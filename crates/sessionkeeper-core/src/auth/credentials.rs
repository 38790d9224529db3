//! Durable key/value persistence for session credentials.
//!
//! Stores hold three logical keys (`access_token`, `refresh_token`,
//! `user_id`) and carry no policy of their own. `AuthState` and the logout
//! cascade are the only callers.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default keychain service name
pub const DEFAULT_SERVICE_NAME: &str = "sessionkeeper";

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USER_ID_KEY: &str = "user_id";

/// Every key a session writes. Cleared together on logout.
pub const SESSION_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY];

/// Credential file name in the data directory
const CREDENTIAL_FILE: &str = "credentials.json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to read '{key}' from credential storage: {message}")]
    Read { key: String, message: String },

    #[error("Failed to write '{key}' to credential storage: {message}")]
    Write { key: String, message: String },

    #[error("Failed to delete '{key}' from credential storage: {message}")]
    Delete { key: String, message: String },

    #[error("Credential storage is corrupt: {0}")]
    Corrupt(String),
}

/// Contract for the host's secure key/value storage.
///
/// Every operation is idempotent. A failed operation must leave the stored
/// value unchanged.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a key. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Delete every session key, continuing past failures.
    /// Returns the first failure encountered.
    fn clear_all(&self) -> Result<(), StorageError> {
        let mut first_error = None;
        for key in SESSION_KEYS {
            if let Err(e) = self.delete(key) {
                warn!(key, error = %e, "Failed to clear credential");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write several keys as one unit.
    fn set_all(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        self.replace_all(entries, &[])
    }

    /// Write `entries` and delete `removals` as one unit.
    ///
    /// If any step fails, keys already touched in this call are restored to
    /// their previous values so no partial set is left behind.
    fn replace_all(&self, entries: &[(&str, &str)], removals: &[&str]) -> Result<(), StorageError> {
        let mut touched: Vec<(&str, Option<String>)> = Vec::with_capacity(entries.len() + removals.len());
        let writes = entries.iter().map(|&(key, value)| (key, Some(value)));
        let deletes = removals.iter().map(|&key| (key, None));
        for (key, value) in writes.chain(deletes) {
            let result = self.get(key).and_then(|previous| {
                let changed = match value {
                    Some(value) => self.set(key, value),
                    None => self.delete(key),
                };
                changed.map(|()| previous)
            });
            match result {
                Ok(previous) => touched.push((key, previous)),
                Err(e) => {
                    restore_previous(self, &touched);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Undo a partially applied `replace_all`, newest change first
fn restore_previous<S: CredentialStore + ?Sized>(store: &S, written: &[(&str, Option<String>)]) {
    for (key, previous) in written.iter().rev() {
        let result = match previous {
            Some(value) => store.set(key, value),
            None => store.delete(key),
        };
        if let Err(e) = result {
            warn!(key, error = %e, "Failed to roll back credential write");
        }
    }
}

// ============================================================================
// OS keychain
// ============================================================================

/// Credential store backed by the OS keychain, one entry per key.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> keyring::Result<Entry> {
        Entry::new(&self.service, key)
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key).and_then(|entry| entry.get_password()) {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::Read {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entry(key)
            .and_then(|entry| entry.set_password(value))
            .map_err(|e| StorageError::Write {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.entry(key).and_then(|entry| entry.delete_credential()) {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StorageError::Delete {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

// ============================================================================
// JSON file
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    entries: BTreeMap<String, String>,
    saved_at: Option<DateTime<Utc>>,
}

/// Credential store backed by a single JSON document.
///
/// Each write replaces the whole document via a temp file and rename, so a
/// reader never sees half of a `set_all`.
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data_local_dir>/sessionkeeper/credentials.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join(DEFAULT_SERVICE_NAME).join(CREDENTIAL_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the document was last written, if it exists
    pub fn saved_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.saved_at)
    }

    fn load(&self) -> Result<CredentialFile, StorageError> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| StorageError::Read {
            key: CREDENTIAL_FILE.to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&contents).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    fn save(&self, mut file: CredentialFile, key: &str) -> Result<(), StorageError> {
        let write_error = |e: std::io::Error| StorageError::Write {
            key: key.to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        file.saved_at = Some(Utc::now());
        let contents = serde_json::to_string_pretty(&file).map_err(|e| StorageError::Write {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents).map_err(write_error)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
                .map_err(write_error)?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(write_error)?;
        debug!(path = ?self.path, "Credential file saved");
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.set_all(&[(key, value)])
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        if file.entries.remove(key).is_none() {
            return Ok(());
        }
        self.save(file, key)
    }

    fn clear_all(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = match self.load() {
            Ok(file) => file,
            // An unreadable document cannot hold a usable session, drop it
            Err(StorageError::Corrupt(_)) => CredentialFile::default(),
            Err(e) => return Err(e),
        };
        for key in SESSION_KEYS {
            file.entries.remove(key);
        }
        self.save(file, "*")
    }

    fn replace_all(&self, entries: &[(&str, &str)], removals: &[&str]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        for &(key, value) in entries {
            file.entries.insert(key.to_string(), value.to_string());
        }
        for key in removals {
            file.entries.remove(*key);
        }
        let first_key = entries
            .first()
            .map(|(key, _)| *key)
            .or_else(|| removals.first().copied())
            .unwrap_or("*");
        self.save(file, first_key)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local credential store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}
