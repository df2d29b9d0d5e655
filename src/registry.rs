use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::docker::{EngineError, EngineResult};

/// How a registry materializes entries from the engine. Implemented once per
/// entity kind (images, containers).
#[async_trait]
pub trait EntrySource: Send + Sync + 'static {
    type Entry: Send + Sync + 'static;

    /// Entity kind for log lines.
    fn kind(&self) -> &'static str;

    /// Every id currently known to the engine.
    async fn list_ids(&self) -> EngineResult<Vec<String>>;

    /// Round-trip a key (id, tag, short id, name) through engine inspection
    /// to the engine-authoritative id.
    async fn resolve_id(&self, key: &str) -> EngineResult<String>;

    /// Build the entry for an engine id. Runs outside the registry lock, so
    /// it may look other entries up (lazily creating them).
    async fn instantiate(&self, id: &str) -> EngineResult<Arc<Self::Entry>>;
}

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// A map keyed by engine-authoritative id that lazily instantiates entries on
/// miss and accepts any alias as a lookup key. Concurrent misses for the same
/// id collapse onto one instantiation: the map holds a once-cell per id, the
/// first caller initializes it, and everyone else observes the winner's entry.
pub struct SyncRegistry<S: EntrySource> {
    source: S,
    entries: Mutex<HashMap<String, Slot<S::Entry>>>,
}

impl<S: EntrySource> SyncRegistry<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Enumerate every existing id from the engine and ensure an entry for
    /// each. Returns the number of entries present afterwards.
    pub async fn initial_sync(&self) -> EngineResult<usize> {
        for id in self.source.list_ids().await? {
            debug!("syncing {} {id}", self.source.kind());
            self.get(&id).await;
        }
        Ok(self.len().await)
    }

    /// Lookup with lazy instantiation: direct hit, then alias resolution
    /// through the engine, then instantiate-and-store. Absent on the engine
    /// means `None`.
    pub async fn get(&self, key: &str) -> Option<Arc<S::Entry>> {
        if let Some(entry) = self.peek(key).await {
            return Some(entry);
        }
        let id = match self.source.resolve_id(key).await {
            Ok(id) => id,
            Err(e) if e.is_not_found() => {
                debug!("no {} matching {key:?}", self.source.kind());
                return None;
            }
            Err(e) => {
                warn!("failed to resolve {} {key:?}: {e}", self.source.kind());
                return None;
            }
        };
        self.ensure(&id).await
    }

    /// Ensure an entry exists for the given key. Re-adding an existing id is
    /// a no-op.
    pub async fn add(&self, key: &str) -> Option<Arc<S::Entry>> {
        self.get(key).await
    }

    /// Direct lookup only: no engine round-trip, no instantiation.
    pub async fn peek(&self, key: &str) -> Option<Arc<S::Entry>> {
        let slot = self.entries.lock().await.get(key).cloned()?;
        slot.get().cloned()
    }

    /// Remove and return the entry stored under the key, resolving aliases
    /// when the key is not a direct hit. `None` when absent.
    pub async fn pop(&self, key: &str) -> Option<Arc<S::Entry>> {
        if let Some(entry) = self.take(key).await {
            return Some(entry);
        }
        let id = self.source.resolve_id(key).await.ok()?;
        self.take(&id).await
    }

    /// Store an entry under the engine id of the key. Refuses to overwrite.
    #[allow(dead_code)]
    pub async fn set(&self, key: &str, value: Arc<S::Entry>) -> EngineResult<()> {
        let id = self.source.resolve_id(key).await?;
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        entries.insert(id, Arc::new(OnceCell::new_with(Some(value))));
        Ok(())
    }

    /// Remove by id or alias; absent keys are tolerated, matching the
    /// engine's own event semantics.
    #[allow(dead_code)]
    pub async fn delete(&self, key: &str) {
        if self.take(key).await.is_some() {
            return;
        }
        if let Ok(id) = self.source.resolve_id(key).await {
            self.take(&id).await;
        }
    }

    /// All instantiated entries.
    pub async fn values(&self) -> Vec<Arc<S::Entry>> {
        self.entries
            .lock()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    #[allow(dead_code)]
    pub async fn contains(&self, id: &str) -> bool {
        self.peek(id).await.is_some()
    }

    /// Get-or-instantiate under an engine-authoritative id. At most one
    /// instantiation per id wins; losers block on the winner's cell.
    async fn ensure(&self, id: &str) -> Option<Arc<S::Entry>> {
        let slot = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        match slot
            .get_or_try_init(|| async {
                debug!("instantiating {} {id}", self.source.kind());
                self.source.instantiate(id).await
            })
            .await
        {
            Ok(entry) => Some(entry.clone()),
            Err(e) => {
                // Drop the empty slot so a later lookup can retry, but only
                // if nobody else initialized it meanwhile.
                let mut entries = self.entries.lock().await;
                if let Some(current) = entries.get(id) {
                    if Arc::ptr_eq(current, &slot) && current.get().is_none() {
                        entries.remove(id);
                    }
                }
                if e.is_not_found() {
                    debug!("{} {id} vanished before instantiation", self.source.kind());
                } else {
                    warn!("failed to instantiate {} {id}: {e}", self.source.kind());
                }
                None
            }
        }
    }

    /// Remove an initialized entry by exact key.
    async fn take(&self, key: &str) -> Option<Arc<S::Entry>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get(key).and_then(|slot| slot.get().cloned())?;
        entries.remove(key);
        Some(entry)
    }
}
