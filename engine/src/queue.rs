//! Keyed update queue.
//!
//! Every durable mutation of a keyed resource goes through [`UpdateQueue::set`].
//! Each key owns a FIFO-fair async lock guarding the last persisted value, so
//! calls for one key run one at a time in submission order while calls for
//! different keys run in parallel.
//!
//! ```text
//! set(k, f) ─► lock slot(k) ─► base = slot.value or store.get(k)
//!                            ─► next = f(base)          (Err: reject this call only)
//!                            ─► store.put(k, next)      (Err: slot keeps base)
//!                            ─► slot.value = next, read cache = next
//! ```
//!
//! A separate cache-only path ([`UpdateQueue::set_cached`]) writes straight to
//! the read cache for high-frequency, non-durable updates such as streaming
//! deltas.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use colloquy_types::{Session, SessionId};
use thiserror::Error;

use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum QueueError<E> {
    #[error("no stored value for {0}")]
    NotFound(String),
    #[error("update rejected: {0}")]
    Rejected(#[source] E),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError<Infallible> {
    /// Widens an infallible queue error into any updater error type.
    pub fn widen<E>(self) -> QueueError<E> {
        match self {
            QueueError::NotFound(key) => QueueError::NotFound(key),
            QueueError::Rejected(never) => match never {},
            QueueError::Store(err) => QueueError::Store(err),
        }
    }
}

/// The queue every durable session mutation goes through.
pub type SessionQueue = UpdateQueue<SessionId, Session>;

/// Last persisted value for one key. `None` until the first update in a burst
/// fetches it.
type Slot<V> = Arc<tokio::sync::Mutex<Option<V>>>;

pub struct UpdateQueue<K, V> {
    store: Arc<dyn Store<K, V>>,
    slots: Mutex<HashMap<K, Slot<V>>>,
    cache: Mutex<HashMap<K, V>>,
}

impl<K, V> UpdateQueue<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(store: Arc<dyn Store<K, V>>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Applies `updater` to the latest value for `key` and persists the result.
    ///
    /// Updates for one key are totally ordered; each observes every update
    /// queued before it. If `updater` or the store fails, only this call is
    /// rejected and later calls build on the last persisted value.
    pub async fn set<F, E>(&self, key: &K, updater: F) -> Result<V, QueueError<E>>
    where
        F: FnOnce(V) -> Result<V, E>,
    {
        let slot = self.slot(key);
        let result = {
            let mut current = slot.lock().await;
            self.apply(key, &mut current, updater).await
        };
        self.release(key, slot);
        result
    }

    /// [`set`](Self::set) for updaters that cannot fail.
    pub async fn update<F>(&self, key: &K, updater: F) -> Result<V, QueueError<Infallible>>
    where
        F: FnOnce(&mut V),
    {
        self.set(key, |mut value| {
            updater(&mut value);
            Ok(value)
        })
        .await
    }

    /// Persists `value` for `key` without reading the previous one. Ordered
    /// with every other durable update for `key`.
    pub async fn insert(&self, key: &K, value: V) -> Result<V, StoreError> {
        let slot = self.slot(key);
        let result = {
            let mut current = slot.lock().await;
            match self.store.put(key, &value).await {
                Ok(()) => {
                    *current = Some(value.clone());
                    self.cache_lock().insert(key.clone(), value.clone());
                    Ok(value)
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "Failed to persist inserted value");
                    Err(err)
                }
            }
        };
        self.release(key, slot);
        result
    }

    /// Deletes `key` from the store and forgets its cached value. Ordered with
    /// every other durable update; later updates see the key as missing.
    pub async fn remove(&self, key: &K) -> Result<bool, StoreError> {
        let slot = self.slot(key);
        let result = {
            let mut current = slot.lock().await;
            let result = self.store.delete(key).await;
            if result.is_ok() {
                *current = None;
                self.evict_cached(key);
            }
            result
        };
        self.release(key, slot);
        result
    }

    /// Latest known value: the read cache if present, otherwise the store.
    pub async fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        if let Some(value) = self.get_cached(key) {
            return Ok(Some(value));
        }
        let value = self.store.get(key).await?;
        if let Some(value) = &value {
            self.cache_lock()
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(value)
    }

    #[must_use]
    pub fn get_cached(&self, key: &K) -> Option<V> {
        self.cache_lock().get(key).cloned()
    }

    /// Mutates the read cache only. Nothing is persisted and the next durable
    /// update for `key` overwrites the cached value. Returns `None` when
    /// `key` is not cached.
    pub fn set_cached<F>(&self, key: &K, updater: F) -> Option<V>
    where
        F: FnOnce(&mut V),
    {
        let mut cache = self.cache_lock();
        let value = cache.get_mut(key)?;
        updater(value);
        Some(value.clone())
    }

    /// Drops the cached value for `key`.
    pub fn evict_cached(&self, key: &K) {
        self.cache_lock().remove(key);
    }

    async fn apply<F, E>(
        &self,
        key: &K,
        current: &mut Option<V>,
        updater: F,
    ) -> Result<V, QueueError<E>>
    where
        F: FnOnce(V) -> Result<V, E>,
    {
        let base = match current.as_ref() {
            Some(value) => value.clone(),
            None => {
                let fetched = self
                    .store
                    .get(key)
                    .await?
                    .ok_or_else(|| QueueError::NotFound(key.to_string()))?;
                *current = Some(fetched.clone());
                fetched
            }
        };

        let next = match updater(base) {
            Ok(next) => next,
            Err(err) => {
                tracing::debug!(key = %key, "Queued update rejected by updater");
                return Err(QueueError::Rejected(err));
            }
        };

        if let Err(err) = self.store.put(key, &next).await {
            tracing::warn!(key = %key, error = %err, "Failed to persist queued update");
            return Err(QueueError::Store(err));
        }

        *current = Some(next.clone());
        self.cache_lock().insert(key.clone(), next.clone());
        Ok(next)
    }

    fn slot(&self, key: &K) -> Slot<V> {
        let mut slots = self.slots_lock();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Forgets an idle slot so the next burst re-reads the store.
    fn release(&self, key: &K, slot: Slot<V>) {
        let mut slots = self.slots_lock();
        // One reference in the map, one held here: nobody else is waiting.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
    }

    fn slots_lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, V>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
