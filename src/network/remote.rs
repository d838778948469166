//! Remote Chunk Storage
//!
//! Client-side storage that fetches chunks from the server on first access.
//! Loading a chunk also subscribes the connection to its updates. The
//! server owns persistence, so writes are dropped.

use std::sync::Arc;
use tracing::debug;

use crate::map::chunk::{Chunk, ChunkIndex};
use crate::map::storage::{ChunkStorage, MapMetadata, StorageError};
use crate::network::link::ServerLink;

/// Chunk storage proxying loads to the server.
pub struct RemoteStorage<L: ServerLink> {
    link: Arc<L>,
}

impl<L: ServerLink> RemoteStorage<L> {
    /// Storage over `link`.
    pub fn new(link: Arc<L>) -> Self {
        Self { link }
    }

    /// The link chunks are fetched through.
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }
}

impl<L: ServerLink> ChunkStorage for RemoteStorage<L> {
    async fn load_chunk(&self, index: ChunkIndex) -> Result<Option<Chunk>, StorageError> {
        let snapshot = self
            .link
            .load_chunk(index)
            .await
            .map_err(|e| StorageError::Remote(e.to_string()))?;
        debug!("Fetched chunk {:?} from server", index);
        Ok(Some(snapshot.chunk))
    }

    async fn save_chunk(&self, _index: ChunkIndex, _chunk: &Chunk) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete_chunk(&self, _index: ChunkIndex) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_metadata(&self) -> Result<Option<MapMetadata>, StorageError> {
        Ok(None)
    }

    async fn save_metadata(&self, _metadata: &MapMetadata) -> Result<(), StorageError> {
        Ok(())
    }
}
