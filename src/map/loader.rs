//! Chunk Loader
//!
//! Owns the chunk cache. Concurrent requests for the same uncached index
//! share one in-flight storage load; an unload cancels a pending load.
//! A failed or cancelled load yields an empty chunk that is never cached.

use std::collections::BTreeMap;
use std::sync::Arc;
use futures_util::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::map::chunk::{Chunk, ChunkIndex};
use crate::map::storage::{ChunkStorage, StorageError};

type SharedLoad = Shared<BoxFuture<'static, Option<Chunk>>>;

/// A storage load in flight.
struct PendingLoad {
    id: u64,
    future: SharedLoad,
    abort: AbortHandle,
}

#[derive(Default)]
struct LoaderState {
    cache: BTreeMap<ChunkIndex, Chunk>,
    pending: BTreeMap<ChunkIndex, PendingLoad>,
    next_load_id: u64,
}

/// Result of making sure a chunk is in the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Already cached.
    Cached,
    /// This call put the chunk into the cache.
    Installed,
    /// Load failed or was cancelled; nothing cached.
    Unavailable,
}

/// Chunk cache in front of a [`ChunkStorage`].
pub struct ChunkLoader<S: ChunkStorage> {
    storage: Arc<S>,
    state: Mutex<LoaderState>,
}

impl<S: ChunkStorage> ChunkLoader<S> {
    /// Create a loader with an empty cache.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            state: Mutex::new(LoaderState::default()),
        }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Make sure `index` is cached, joining an in-flight load if one exists.
    pub async fn load(&self, index: ChunkIndex) -> LoadOutcome {
        let (id, future) = {
            let mut state = self.state.lock().await;
            if state.cache.contains_key(&index) {
                return LoadOutcome::Cached;
            }
            match state.pending.get(&index) {
                Some(pending) => (pending.id, pending.future.clone()),
                None => {
                    let id = state.next_load_id;
                    state.next_load_id += 1;
                    let (future, abort) = self.start_load(index);
                    state.pending.insert(index, PendingLoad { id, future: future.clone(), abort });
                    (id, future)
                }
            }
        };

        let loaded = future.await;

        let mut state = self.state.lock().await;
        let owner = state.pending.get(&index).is_some_and(|pending| pending.id == id);
        if !owner {
            // Another waiter installed it, or an unload got in between
            return if state.cache.contains_key(&index) {
                LoadOutcome::Cached
            } else {
                LoadOutcome::Unavailable
            };
        }

        state.pending.remove(&index);
        match loaded {
            Some(chunk) => {
                state.cache.insert(index, chunk);
                debug!("Installed chunk {:?} ({} cached)", index, state.cache.len());
                LoadOutcome::Installed
            }
            None => LoadOutcome::Unavailable,
        }
    }

    fn start_load(&self, index: ChunkIndex) -> (SharedLoad, AbortHandle) {
        let storage = Arc::clone(&self.storage);
        let (abort, registration) = AbortHandle::new_pair();
        let load = Abortable::new(async move { storage.load_chunk(index).await }, registration);

        let future = async move {
            match load.await {
                Ok(Ok(Some(chunk))) => Some(chunk),
                Ok(Ok(None)) => Some(Chunk::empty()),
                Ok(Err(e)) => {
                    warn!("Failed to load chunk {:?}: {}", index, e);
                    None
                }
                Err(_) => {
                    debug!("Load of chunk {:?} cancelled", index);
                    None
                }
            }
        }
        .boxed()
        .shared();

        (future, abort)
    }

    /// Get a chunk, loading it if needed.
    ///
    /// Returns a copy of the cached chunk, or an empty chunk if it could
    /// not be loaded.
    pub async fn get(&self, index: ChunkIndex) -> Chunk {
        self.read(index, Chunk::clone).await
    }

    /// Load if needed, then run `f` against the chunk under the cache lock.
    pub async fn read<R>(&self, index: ChunkIndex, f: impl FnOnce(&Chunk) -> R) -> R {
        self.load(index).await;
        let state = self.state.lock().await;
        match state.cache.get(&index) {
            Some(chunk) => f(chunk),
            None => f(&Chunk::empty()),
        }
    }

    /// Load if needed, then mutate the cached chunk.
    ///
    /// Returns `None` if the chunk is unavailable; the write is dropped
    /// rather than applied to a placeholder that could later overwrite
    /// stored data.
    pub async fn update<R>(&self, index: ChunkIndex, f: impl FnOnce(&mut Chunk) -> R) -> Option<R> {
        self.load(index).await;
        let mut state = self.state.lock().await;
        match state.cache.get_mut(&index) {
            Some(chunk) => Some(f(chunk)),
            None => {
                warn!("Dropped write to unavailable chunk {:?}", index);
                None
            }
        }
    }

    /// Put a chunk into the cache, replacing whatever is there.
    ///
    /// Cancels a pending load of the same index.
    pub async fn insert(&self, index: ChunkIndex, chunk: Chunk) -> Option<Chunk> {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.remove(&index) {
            pending.abort.abort();
        }
        state.cache.insert(index, chunk)
    }

    /// Check if a chunk is cached.
    pub async fn is_cached(&self, index: ChunkIndex) -> bool {
        self.state.lock().await.cache.contains_key(&index)
    }

    /// Indices of every cached chunk.
    pub async fn cached_indices(&self) -> Vec<ChunkIndex> {
        self.state.lock().await.cache.keys().copied().collect()
    }

    /// Remove a chunk from the cache.
    ///
    /// Cancels a pending load. If the chunk was cached and `save_changes`
    /// is set, a changed chunk is saved (or deleted if empty) first.
    /// Returns the evicted chunk.
    pub async fn unload(&self, index: ChunkIndex, save_changes: bool) -> Result<Option<Chunk>, StorageError> {
        let evicted = {
            let mut state = self.state.lock().await;
            if let Some(pending) = state.pending.remove(&index) {
                pending.abort.abort();
                debug!("Cancelled pending load of chunk {:?}", index);
            }
            state.cache.remove(&index)
        };

        if let Some(chunk) = &evicted {
            if save_changes && chunk.has_changed() {
                self.save_or_delete(index, chunk).await?;
            }
            debug!("Unloaded chunk {:?}", index);
        }
        Ok(evicted)
    }

    /// Persist a chunk, or delete it from storage if nothing is designed.
    pub async fn save_or_delete(&self, index: ChunkIndex, chunk: &Chunk) -> Result<(), StorageError> {
        if chunk.is_empty() {
            self.storage.delete_chunk(index).await
        } else {
            self.storage.save_chunk(index, chunk).await
        }
    }

    /// Sweep the cache.
    ///
    /// Empty chunks are deleted from storage and evicted; changed chunks are
    /// saved and marked clean unless they changed again during the save.
    /// Returns `(saved, deleted)`.
    pub async fn save_changes(&self) -> Result<(usize, usize), StorageError> {
        let (empty, changed) = {
            let mut state = self.state.lock().await;
            let empty: Vec<ChunkIndex> = state
                .cache
                .iter()
                .filter(|(_, chunk)| chunk.is_empty())
                .map(|(index, _)| *index)
                .collect();
            for index in &empty {
                state.cache.remove(index);
            }
            let changed: Vec<(ChunkIndex, Chunk)> = state
                .cache
                .iter()
                .filter(|(_, chunk)| chunk.has_changed())
                .map(|(index, chunk)| (*index, chunk.clone()))
                .collect();
            (empty, changed)
        };

        for index in &empty {
            self.storage.delete_chunk(*index).await?;
        }

        for (index, saved) in &changed {
            self.storage.save_chunk(*index, saved).await?;
            let mut state = self.state.lock().await;
            if let Some(chunk) = state.cache.get_mut(index) {
                if chunk.same_content(saved) {
                    chunk.mark_saved();
                }
            }
        }

        if !empty.is_empty() || !changed.is_empty() {
            info!("Saved {} chunks, deleted {} empty chunks", changed.len(), empty.len());
        }
        Ok((changed.len(), empty.len()))
    }
}
