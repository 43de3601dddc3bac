//! Persistence collaborators.
//!
//! The update queue is the only caller of [`Store::put`]. Implementations
//! only need to be durable; ordering is the queue's job.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use colloquy_types::{Session, SessionId};
use colloquy_utils::{Durability, Recovery, restore_interrupted, write_document};
use thiserror::Error;

/// Store operation future type alias.
pub type StoreFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode session {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Keyed persistence: `get` returns the latest persisted value, `put`
/// replaces it.
pub trait Store<K, V>: Send + Sync {
    fn get<'a>(&'a self, key: &'a K) -> StoreFut<'a, Option<V>>;

    fn put<'a>(&'a self, key: &'a K, value: &'a V) -> StoreFut<'a, ()>;

    /// Removes the value for `key`. Returns whether one existed.
    fn delete<'a>(&'a self, key: &'a K) -> StoreFut<'a, bool>;
}

/// A [`Store`] of sessions keyed by session id.
pub trait SessionStore: Store<SessionId, Session> {}

impl<T: Store<SessionId, Session> + ?Sized> SessionStore for T {}

/// In-memory store. Values live for the lifetime of the store.
#[derive(Debug)]
pub struct MemoryStore<K, V> {
    values: Mutex<HashMap<K, V>>,
}

pub type MemorySessionStore = MemoryStore<SessionId, Session>;

impl<K, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds or replaces a value without going through the queue.
    pub fn insert(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    #[must_use]
    pub fn snapshot(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, V>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Store<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get<'a>(&'a self, key: &'a K) -> StoreFut<'a, Option<V>> {
        Box::pin(async move { Ok(self.snapshot(key)) })
    }

    fn put<'a>(&'a self, key: &'a K, value: &'a V) -> StoreFut<'a, ()> {
        Box::pin(async move {
            self.insert(key.clone(), value.clone());
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a K) -> StoreFut<'a, bool> {
        Box::pin(async move { Ok(self.remove(key).is_some()) })
    }
}

/// One JSON document per session under a directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
    durability: Durability,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            durability: Durability::default(),
        }
    }

    #[must_use]
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Default session directory (`~/.colloquy/sessions`).
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".colloquy").join("sessions"))
    }

    fn session_path(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(raw.to_string()));
        }
        Ok(self.dir.join(format!("{raw}.json")))
    }
}

impl Store<SessionId, Session> for FileSessionStore {
    fn get<'a>(&'a self, key: &'a SessionId) -> StoreFut<'a, Option<Session>> {
        Box::pin(async move {
            let path = self.session_path(key)?;
            let read_path = path.clone();
            let bytes = tokio::task::spawn_blocking(move || {
                if restore_interrupted(&read_path) == Recovery::Failed {
                    tracing::warn!(path = %read_path.display(), "Reading session without its backup");
                }
                std::fs::read(&read_path)
            })
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(StoreError::Read { path, source }),
            };

            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Decode { path, source })
        })
    }

    fn put<'a>(&'a self, key: &'a SessionId, value: &'a Session) -> StoreFut<'a, ()> {
        Box::pin(async move {
            let path = self.session_path(key)?;
            let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
                id: key.to_string(),
                source,
            })?;
            let durability = self.durability;
            let write_path = path.clone();
            let result = tokio::task::spawn_blocking(move || {
                write_document(&write_path, &bytes, durability)
            })
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

            result.map_err(|source| StoreError::Write { path, source })?;
            tracing::debug!(session_id = %key, "Persisted session");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a SessionId) -> StoreFut<'a, bool> {
        Box::pin(async move {
            let path = self.session_path(key)?;
            let remove_path = path.clone();
            let removed = tokio::task::spawn_blocking(move || {
                let _ = std::fs::remove_file(remove_path.with_extension("bak"));
                std::fs::remove_file(&remove_path)
            })
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

            match removed {
                Ok(()) => {
                    tracing::debug!(session_id = %key, "Deleted session");
                    Ok(true)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(source) => Err(StoreError::Write { path, source }),
            }
        })
    }
}
