//! Chunk Storage
//!
//! The persistence boundary of the map. Only the load/save/delete contract
//! matters to the engine; backends are interchangeable.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::point::Point;
use crate::core::rect::Rect;
use crate::map::chunk::{Chunk, ChunkIndex};
use crate::map::tile::{PlayerId, RegionId};

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk encoding error.
    #[error("Chunk encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Metadata encoding error.
    #[error("Metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote backend failed.
    #[error("Remote storage error: {0}")]
    Remote(String),

    /// Injected failure (memory backend).
    #[error("Storage unavailable")]
    Unavailable,
}

/// Map-level metadata stored next to the chunks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapMetadata {
    /// Last committed global version.
    pub version: u64,
    /// Region new players spawn in.
    pub default_region: RegionId,
    /// Spawn area per region.
    pub spawn_areas: BTreeMap<RegionId, Rect>,
    /// Last known position of every player that ever connected.
    pub players: BTreeMap<PlayerId, Point>,
    /// When this metadata was last written.
    pub saved_at: Option<DateTime<Utc>>,
}

/// Chunk storage collaborator.
///
/// All operations are suspension points. Implementations must be cheap to
/// share: the loader keeps them behind an `Arc` and calls them from
/// spawned load futures.
pub trait ChunkStorage: Send + Sync + 'static {
    /// Load a chunk. `Ok(None)` means nothing is stored at `index`.
    fn load_chunk(&self, index: ChunkIndex)
        -> impl Future<Output = Result<Option<Chunk>, StorageError>> + Send;

    /// Store a chunk, replacing any previous one.
    fn save_chunk(&self, index: ChunkIndex, chunk: &Chunk)
        -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Remove a stored chunk. Deleting a missing chunk is not an error.
    fn delete_chunk(&self, index: ChunkIndex)
        -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Load map-level metadata.
    fn load_metadata(&self)
        -> impl Future<Output = Result<Option<MapMetadata>, StorageError>> + Send;

    /// Store map-level metadata.
    fn save_metadata(&self, metadata: &MapMetadata)
        -> impl Future<Output = Result<(), StorageError>> + Send;
}

// =============================================================================
// MEMORY STORAGE
// =============================================================================

/// In-memory backend.
///
/// Counts loads and can inject latency or failures, which makes the
/// loader's deduplication and fallback behavior observable.
#[derive(Default)]
pub struct MemoryStorage {
    chunks: RwLock<BTreeMap<ChunkIndex, Chunk>>,
    metadata: RwLock<Option<MapMetadata>>,
    load_calls: AtomicUsize,
    latency_ms: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load_chunk` calls so far.
    pub fn load_count(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Delay every load by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as usize, Ordering::SeqCst);
    }

    /// Make every load fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stored copy of a chunk.
    pub async fn stored(&self, index: ChunkIndex) -> Option<Chunk> {
        self.chunks.read().await.get(&index).cloned()
    }

    /// Put a chunk directly into the store.
    pub async fn insert(&self, index: ChunkIndex, chunk: Chunk) {
        self.chunks.write().await.insert(index, chunk);
    }

    /// Number of stored chunks.
    pub async fn chunk_count(&self) -> usize {
        self.chunks.read().await.len()
    }
}

impl ChunkStorage for MemoryStorage {
    async fn load_chunk(&self, index: ChunkIndex) -> Result<Option<Chunk>, StorageError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable);
        }

        Ok(self.chunks.read().await.get(&index).cloned())
    }

    async fn save_chunk(&self, index: ChunkIndex, chunk: &Chunk) -> Result<(), StorageError> {
        let mut stored = chunk.clone();
        stored.mark_saved();
        self.chunks.write().await.insert(index, stored);
        Ok(())
    }

    async fn delete_chunk(&self, index: ChunkIndex) -> Result<(), StorageError> {
        self.chunks.write().await.remove(&index);
        Ok(())
    }

    async fn load_metadata(&self) -> Result<Option<MapMetadata>, StorageError> {
        Ok(self.metadata.read().await.clone())
    }

    async fn save_metadata(&self, metadata: &MapMetadata) -> Result<(), StorageError> {
        *self.metadata.write().await = Some(metadata.clone());
        Ok(())
    }
}

// =============================================================================
// FILE STORAGE
// =============================================================================

/// Directory backend: one bincode file per chunk plus `map.json`.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn chunk_path(&self, index: ChunkIndex) -> PathBuf {
        self.root.join(format!("chunk_{}_{}.bin", index.x, index.y))
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join("map.json")
    }

    /// Write through a temporary file so readers never see half a file.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl ChunkStorage for FileStorage {
    async fn load_chunk(&self, index: ChunkIndex) -> Result<Option<Chunk>, StorageError> {
        match tokio::fs::read(self.chunk_path(index)).await {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_chunk(&self, index: ChunkIndex, chunk: &Chunk) -> Result<(), StorageError> {
        let bytes = bincode::serialize(chunk)?;
        self.write_atomic(&self.chunk_path(index), &bytes).await?;
        debug!("Saved chunk {:?} ({} bytes)", index, bytes.len());
        Ok(())
    }

    async fn delete_chunk(&self, index: ChunkIndex) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.chunk_path(index)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_metadata(&self) -> Result<Option<MapMetadata>, StorageError> {
        match tokio::fs::read(self.metadata_path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_metadata(&self, metadata: &MapMetadata) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(metadata)?;
        self.write_atomic(&self.metadata_path(), &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::map::tile::Tile;
    use crate::map::tiles::TileKind;

    fn designed_chunk() -> Chunk {
        let mut chunk = Chunk::empty();
        chunk.design(Point::new(2, 3), Tile::new(TileKind::Wall), 1, 4);
        chunk
    }

    #[tokio::test]
    async fn test_memory_roundtrip_and_count() {
        let storage = MemoryStorage::new();
        let index = ChunkIndex::new(0, 0);

        assert!(storage.load_chunk(index).await.unwrap().is_none());
        storage.save_chunk(index, &designed_chunk()).await.unwrap();

        let loaded = storage.load_chunk(index).await.unwrap().unwrap();
        assert!(loaded.same_content(&designed_chunk()));
        assert!(!loaded.has_changed());
        assert_eq!(storage.load_count(), 2);

        storage.delete_chunk(index).await.unwrap();
        assert_eq!(storage.chunk_count().await, 0);
    }

    #[tokio::test]
    async fn test_memory_failure_injection() {
        let storage = MemoryStorage::new();
        storage.set_failing(true);
        assert!(matches!(
            storage.load_chunk(ChunkIndex::new(0, 0)).await,
            Err(StorageError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let index = ChunkIndex::new(-1, 2);

        assert!(storage.load_chunk(index).await.unwrap().is_none());
        storage.save_chunk(index, &designed_chunk()).await.unwrap();
        let loaded = storage.load_chunk(index).await.unwrap().unwrap();
        assert!(loaded.same_content(&designed_chunk()));

        storage.delete_chunk(index).await.unwrap();
        storage.delete_chunk(index).await.unwrap();
        assert!(storage.load_chunk(index).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_rejects_short_chunk() {
        use crate::map::loader::ChunkLoader;
        use crate::map::tile::{TileInfo, TileMetadata};

        #[derive(Serialize)]
        struct Short {
            tiles: Vec<TileInfo>,
            metadata: Vec<TileMetadata>,
        }

        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        let index = ChunkIndex::new(0, 0);
        let short = Short { tiles: vec![TileInfo::default()], metadata: vec![TileMetadata::default()] };
        tokio::fs::write(storage.chunk_path(index), bincode::serialize(&short).unwrap()).await.unwrap();

        assert!(matches!(storage.load_chunk(index).await, Err(StorageError::Encoding(_))));

        // Loader falls back to an empty chunk instead of indexing past the end
        let loader = ChunkLoader::new(Arc::clone(&storage));
        assert_eq!(loader.read(index, |c| c.get(Point::new(1, 1)).clone()).await, TileInfo::default());
        assert!(!loader.is_cached(index).await);
    }

    #[tokio::test]
    async fn test_file_storage_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        assert!(storage.load_metadata().await.unwrap().is_none());

        let mut metadata = MapMetadata { version: 42, ..Default::default() };
        metadata.spawn_areas.insert(0, Rect::from_size(Point::new(1, 1), 2, 2));
        metadata.players.insert(PlayerId::new([9; 16]), Point::new(3, 4));
        metadata.saved_at = Some(Utc::now());

        storage.save_metadata(&metadata).await.unwrap();
        assert_eq!(storage.load_metadata().await.unwrap(), Some(metadata));
    }
}
