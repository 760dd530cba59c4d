//! Durable key-value storage for the session's token pair

use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use crate::{AccessToken, RefreshToken};

/// A synchronous, unvalidated key-value surface holding raw token strings
///
/// Implementations are shared by every in-flight request and by the expiry
/// watch, so they use interior mutability. Writes are last-write-wins.
pub trait TokenStore: Send + Sync {
    /// Reads the value stored under `key`
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str);

    /// Removes any value stored under `key`
    fn remove(&self, key: &str);
}

impl<T: TokenStore + ?Sized> TokenStore for Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key)
    }
}

/// The well-known keys under which a session's tokens are stored
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenKeys {
    /// Key of the access token
    pub access: &'static str,
    /// Key of the refresh token
    pub refresh: &'static str,
}

impl TokenKeys {
    /// Keys of the regular user session
    pub const USER: Self = Self {
        access: "access_token",
        refresh: "refresh_token",
    };

    /// Keys of the administration dashboard session
    pub const ADMIN: Self = Self {
        access: "admin_access_token",
        refresh: "admin_refresh_token",
    };
}

impl Default for TokenKeys {
    fn default() -> Self {
        Self::USER
    }
}

/// An access token together with the refresh token issued alongside it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPair {
    /// The bearer credential attached to API requests
    pub access_token: AccessToken,
    /// The credential exchanged for a new access token
    pub refresh_token: RefreshToken,
}

impl TokenPair {
    /// Reads the pair stored under `keys`
    ///
    /// The pair is all-or-nothing: if only one of the two tokens is present,
    /// there is no session and `None` is returned.
    pub fn load(store: &dyn TokenStore, keys: TokenKeys) -> Option<Self> {
        match (store.get(keys.access), store.get(keys.refresh)) {
            (Some(access), Some(refresh)) => Some(Self {
                access_token: AccessToken::new(access),
                refresh_token: RefreshToken::new(refresh),
            }),
            (None, None) => None,
            (access, _) => {
                tracing::debug!(
                    dangling = if access.is_some() { keys.access } else { keys.refresh },
                    "ignoring incomplete token pair"
                );
                None
            }
        }
    }

    /// Writes both tokens under `keys`
    pub fn persist(&self, store: &dyn TokenStore, keys: TokenKeys) {
        store.set(keys.access, self.access_token.as_str());
        store.set(keys.refresh, self.refresh_token.as_str());
    }

    /// Removes both tokens stored under `keys`
    pub fn clear(store: &dyn TokenStore, keys: TokenKeys) {
        store.remove(keys.access);
        store.remove(keys.refresh);
    }
}

/// A process-local token store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryTokenStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// A token store persisted to a JSON file, surviving restarts
///
/// Reads are served from an in-memory mirror; every change is written
/// through to the file. A write failure is logged and leaves the mirror
/// updated, so the running process keeps its session.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileTokenStore {
    /// Opens the store at `path`, reading any values already saved there
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match read_values(&path) {
            Ok(values) => values,
            Err(error) if error.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = (&error as &dyn std::error::Error),
                    "unable to read token file, starting empty"
                );
                BTreeMap::new()
            }
        };

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn values(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_through(&self, values: &BTreeMap<String, String>) {
        if let Err(error) = write_values(&self.path, values) {
            tracing::warn!(
                path = %self.path.display(),
                error = (&error as &dyn std::error::Error),
                "unable to persist token file"
            );
        }
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut values = self.values();
        values.insert(key.to_owned(), value.to_owned());
        self.write_through(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = self.values();
        if values.remove(key).is_some() {
            self.write_through(&values);
        }
    }
}

fn read_values(path: &Path) -> Result<BTreeMap<String, String>, io::Error> {
    let data = fs::read_to_string(path)?;
    let values = serde_json::from_str(&data)?;
    Ok(values)
}

fn write_values(path: &Path, values: &BTreeMap<String, String>) -> Result<(), io::Error> {
    let mut file_opts = OpenOptions::new();

    file_opts.create(true).truncate(true).write(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        file_opts.mode(0o600);
    }

    let mut file = file_opts.open(path)?;
    let data = serde_json::to_string_pretty(values)?;
    file.write_all(data.as_bytes())?;
    Ok(())
}
