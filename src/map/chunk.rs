//! Map Chunks
//!
//! Fixed-size square blocks of tiles: the unit of loading, caching,
//! saving and subscription.

use serde::{Serialize, Deserialize};

use crate::core::point::Point;
use crate::core::rect::Rect;
use crate::map::tile::{Tile, TileInfo, TileMetadata};

/// Chunk side length in tiles.
pub const CHUNK_SIZE: i32 = 8;

/// Tiles per chunk.
pub const CHUNK_AREA: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;

/// Chunk coordinates (position divided by [`CHUNK_SIZE`], floored).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ChunkIndex {
    /// Chunk column.
    pub x: i32,
    /// Chunk row.
    pub y: i32,
}

impl ChunkIndex {
    /// Create a chunk index.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing a map position.
    pub fn of(position: Point) -> Self {
        let p = position.div_floor(CHUNK_SIZE);
        Self::new(p.x, p.y)
    }

    /// First map position of this chunk.
    pub fn origin(self) -> Point {
        Point::new(self.x * CHUNK_SIZE, self.y * CHUNK_SIZE)
    }

    /// Map positions covered by this chunk.
    pub fn bounds(self) -> Rect {
        Rect::from_size(self.origin(), CHUNK_SIZE, CHUNK_SIZE)
    }
}

/// Slot of a map position inside its chunk.
#[inline]
fn slot(position: Point) -> usize {
    let local = position.rem_floor(CHUNK_SIZE);
    (local.y * CHUNK_SIZE + local.x) as usize
}

/// A block of [`CHUNK_SIZE`]² tiles and their designed metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawChunk")]
pub struct Chunk {
    tiles: Vec<TileInfo>,
    metadata: Vec<TileMetadata>,
    #[serde(skip)]
    has_changed: bool,
}

/// Wire and disk shape of a chunk, checked before use.
#[derive(Deserialize)]
struct RawChunk {
    tiles: Vec<TileInfo>,
    metadata: Vec<TileMetadata>,
}

impl TryFrom<RawChunk> for Chunk {
    type Error = String;

    fn try_from(raw: RawChunk) -> Result<Self, Self::Error> {
        if raw.tiles.len() != CHUNK_AREA || raw.metadata.len() != CHUNK_AREA {
            return Err(format!(
                "chunk holds {} tiles and {} metadata slots, expected {}",
                raw.tiles.len(),
                raw.metadata.len(),
                CHUNK_AREA
            ));
        }
        Ok(Self {
            tiles: raw.tiles,
            metadata: raw.metadata,
            has_changed: false,
        })
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::empty()
    }
}

impl Chunk {
    /// Chunk where nothing is designed.
    pub fn empty() -> Self {
        Self {
            tiles: vec![TileInfo::default(); CHUNK_AREA],
            metadata: vec![TileMetadata::default(); CHUNK_AREA],
            has_changed: false,
        }
    }

    /// Tile at a map position (must lie inside this chunk).
    pub fn get(&self, position: Point) -> &TileInfo {
        &self.tiles[slot(position)]
    }

    /// Metadata at a map position.
    pub fn metadata(&self, position: Point) -> &TileMetadata {
        &self.metadata[slot(position)]
    }

    /// Replace a tile. Returns the previous value.
    pub fn set(&mut self, position: Point, info: TileInfo) -> TileInfo {
        self.has_changed = true;
        std::mem::replace(&mut self.tiles[slot(position)], info)
    }

    /// Replace the designed metadata of a position.
    pub fn set_metadata(&mut self, position: Point, metadata: TileMetadata) {
        self.has_changed = true;
        self.metadata[slot(position)] = metadata;
    }

    /// Dirty flag: in-memory state differs from what is stored.
    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    /// Clear the dirty flag after a successful save.
    pub fn mark_saved(&mut self) {
        self.has_changed = false;
    }

    /// True if every metadata slot is the empty template.
    pub fn is_empty(&self) -> bool {
        self.metadata.iter().all(TileMetadata::is_empty)
    }

    /// Same tiles and metadata, ignoring the dirty flag.
    pub fn same_content(&self, other: &Chunk) -> bool {
        self.tiles == other.tiles && self.metadata == other.metadata
    }

    /// Iterate `(position, tile)` for a chunk placed at `index`.
    pub fn tiles(&self, index: ChunkIndex) -> impl Iterator<Item = (Point, &TileInfo)> + '_ {
        index.bounds().points().zip(self.tiles.iter())
    }

    /// Iterate `(position, metadata)` for a chunk placed at `index`.
    pub fn metadata_slots(&self, index: ChunkIndex) -> impl Iterator<Item = (Point, &TileMetadata)> + '_ {
        index.bounds().points().zip(self.metadata.iter())
    }

    /// Write a designed tile: both the template and the live tile.
    pub fn design(&mut self, position: Point, tile: Tile, region: u32, version: u64) {
        self.set_metadata(position, TileMetadata::new(tile.clone(), region));
        self.set(position, TileInfo::new(tile, version));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::tiles::TileKind;

    #[test]
    fn test_chunk_index_of_negative() {
        assert_eq!(ChunkIndex::of(Point::new(0, 0)), ChunkIndex::new(0, 0));
        assert_eq!(ChunkIndex::of(Point::new(7, 7)), ChunkIndex::new(0, 0));
        assert_eq!(ChunkIndex::of(Point::new(8, 0)), ChunkIndex::new(1, 0));
        assert_eq!(ChunkIndex::of(Point::new(-1, -8)), ChunkIndex::new(-1, -1));
        assert_eq!(ChunkIndex::of(Point::new(-9, 0)), ChunkIndex::new(-2, 0));
    }

    #[test]
    fn test_dirty_flag() {
        let mut chunk = Chunk::empty();
        assert!(!chunk.has_changed());

        chunk.set(Point::new(3, 4), TileInfo::new(Tile::new(TileKind::Path), 1));
        assert!(chunk.has_changed());
        assert_eq!(chunk.get(Point::new(3, 4)).version, 1);

        chunk.mark_saved();
        assert!(!chunk.has_changed());
    }

    #[test]
    fn test_is_empty_follows_metadata() {
        let mut chunk = Chunk::empty();
        assert!(chunk.is_empty());

        // Live tiles alone do not make a chunk designed
        chunk.set(Point::new(1, 1), TileInfo::new(Tile::new(TileKind::Path), 1));
        assert!(chunk.is_empty());

        chunk.design(Point::new(1, 1), Tile::new(TileKind::Wall), 0, 2);
        assert!(!chunk.is_empty());
    }

    #[test]
    fn test_tiles_iterates_positions() {
        let index = ChunkIndex::new(-1, 2);
        let mut chunk = Chunk::empty();
        chunk.design(Point::new(-8, 16), Tile::new(TileKind::Path), 0, 1);

        let positions: Vec<_> = chunk.tiles(index).map(|(p, _)| p).collect();
        assert_eq!(positions.len(), CHUNK_AREA);
        assert_eq!(positions[0], Point::new(-8, 16));
        assert_eq!(positions[CHUNK_AREA - 1], Point::new(-1, 23));
        let (first, info) = chunk.tiles(index).next().unwrap();
        assert_eq!(first, Point::new(-8, 16));
        assert_eq!(info.tile.kind(), &TileKind::Path);
    }

    #[test]
    fn test_serde_skips_dirty_flag() {
        let mut chunk = Chunk::empty();
        chunk.design(Point::new(0, 0), Tile::new(TileKind::Path), 1, 5);
        let bytes = bincode::serialize(&chunk).unwrap();
        let restored: Chunk = bincode::deserialize(&bytes).unwrap();
        assert!(!restored.has_changed());
        assert!(restored.same_content(&chunk));
    }

    #[test]
    fn test_rejects_wrong_size() {
        assert!(serde_json::from_str::<Chunk>(r#"{"tiles":[],"metadata":[]}"#).is_err());

        let mut json = serde_json::to_value(Chunk::empty()).unwrap();
        json["metadata"].as_array_mut().unwrap().pop();
        assert!(serde_json::from_value::<Chunk>(json).is_err());

        let json = serde_json::to_string(&Chunk::empty()).unwrap();
        assert!(serde_json::from_str::<Chunk>(&json).is_ok());
    }
}
