//! Map Orchestrator
//!
//! Owns the chunk loader and the dependency table and runs the move
//! protocol: detach from the source, attach to the target (pushing or
//! collecting an occupant), then propagate derived state through the
//! dependency graph and run follow-up hooks.
//!
//! Everything is `&self`; a map is shared behind an `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::core::point::Point;
use crate::core::rect::Rect;
use crate::map::chunk::{Chunk, ChunkIndex};
use crate::map::dependency::{DependencyError, DependencyWalk, MapDependencyTable, Visit};
use crate::map::events::{GameEvent, Initiator};
use crate::map::loader::{ChunkLoader, LoadOutcome};
use crate::map::storage::{ChunkStorage, MapMetadata, StorageError};
use crate::map::tile::{
    Attach, Completion, CompletionContext, Detach, Entity, FollowUp, FollowUpContext,
    FollowUpTrigger, MoveStep, PlayerId, RegionId, Tile, TileBehavior, TileInfo, TileMetadata, Yield,
};
use crate::map::transaction::{CommitSummary, TransactionChain};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Map tuning.
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Visits allowed per propagation before it is declared cyclic.
    pub propagation_budget: usize,
    /// Nesting limit for follow-up moves (teleport chains).
    pub max_follow_up_depth: usize,
    /// Game event channel capacity.
    pub event_capacity: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            propagation_budget: 4096,
            max_follow_up_depth: 8,
            event_capacity: 1024,
        }
    }
}

/// Map errors.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// Storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Dependency graph is inconsistent.
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),
}

// =============================================================================
// MAP
// =============================================================================

/// Chunked tile world.
pub struct Map<S: ChunkStorage> {
    loader: ChunkLoader<S>,
    dependencies: RwLock<MapDependencyTable>,
    metadata: RwLock<MapMetadata>,
    version: AtomicU64,
    events: broadcast::Sender<GameEvent>,
    config: MapConfig,
}

impl<S: ChunkStorage> Map<S> {
    /// Open a map on `storage`, restoring its metadata.
    pub async fn open(storage: Arc<S>, config: MapConfig) -> Result<Self, MapError> {
        let metadata = storage.load_metadata().await?.unwrap_or_default();
        let (events, _) = broadcast::channel(config.event_capacity);
        info!(
            "Opened map at version {} ({} known players)",
            metadata.version,
            metadata.players.len()
        );

        Ok(Self {
            loader: ChunkLoader::new(storage),
            dependencies: RwLock::new(MapDependencyTable::new()),
            version: AtomicU64::new(metadata.version),
            metadata: RwLock::new(metadata),
            events,
            config,
        })
    }

    /// Map configuration.
    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Arc<S> {
        self.loader.storage()
    }

    /// Subscribe to committed game events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<GameEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // VERSIONS
    // =========================================================================

    /// Reserve the next global version.
    pub fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last reserved version.
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Tile at `position`. Loads its chunk if needed; never fails.
    pub async fn get(&self, position: Point) -> TileInfo {
        let index = ChunkIndex::of(position);
        self.ensure_chunk(index).await;
        self.loader.read(index, |chunk| chunk.get(position).clone()).await
    }

    /// Designed state of `position`.
    pub async fn get_metadata(&self, position: Point) -> TileMetadata {
        let index = ChunkIndex::of(position);
        self.ensure_chunk(index).await;
        self.loader.read(index, |chunk| chunk.metadata(position).clone()).await
    }

    /// Copy of a whole chunk.
    pub async fn chunk_snapshot(&self, index: ChunkIndex) -> Chunk {
        self.ensure_chunk(index).await;
        self.loader.get(index).await
    }

    /// Indices of every cached chunk.
    pub async fn cached_chunks(&self) -> Vec<ChunkIndex> {
        self.loader.cached_indices().await
    }

    /// Snapshot of map metadata.
    pub async fn metadata(&self) -> MapMetadata {
        self.metadata.read().await.clone()
    }

    /// Last known position of a player.
    pub async fn player_position(&self, id: PlayerId) -> Option<Point> {
        self.metadata.read().await.players.get(&id).copied()
    }

    /// Spawn area of a region.
    pub async fn spawn_area(&self, region: RegionId) -> Option<Rect> {
        self.metadata.read().await.spawn_areas.get(&region).copied()
    }

    /// Spawn area of the default region.
    pub async fn default_spawn_area(&self) -> Option<Rect> {
        let metadata = self.metadata.read().await;
        metadata.spawn_areas.get(&metadata.default_region).copied()
    }

    /// Dependents of `position` currently registered.
    pub async fn dependents_of(&self, position: Point) -> Vec<Point> {
        self.dependencies.read().await.dependents_of(position).collect()
    }

    // =========================================================================
    // CHUNK LIFECYCLE
    // =========================================================================

    fn ensure_chunk(&self, index: ChunkIndex) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.loader.load(index).await == LoadOutcome::Installed {
                self.on_chunk_loaded(index).await;
            }
        })
    }

    async fn on_chunk_loaded(&self, index: ChunkIndex) {
        let declaring = self.loader.read(index, |chunk| declaring_tiles(chunk, index)).await;
        {
            let mut table = self.dependencies.write().await;
            for (position, tile) in &declaring {
                if let Err(e) = table.add_dependencies_of(tile, *position) {
                    warn!("Skipped dependencies of {} at {}: {}", tile.kind().name(), position, e);
                }
            }
        }
        debug!("Chunk {:?} loaded with {} dependent tiles", index, declaring.len());

        // Derived state may be stale relative to what is now loaded around it
        self.refresh(index.bounds().points().collect(), false, index.origin()).await;
    }

    /// Recompute derived state from `positions` without bumping versions.
    async fn refresh(&self, positions: Vec<Point>, seeds_changed: bool, origin: Point) {
        let mut chain = TransactionChain::new(Initiator::system(origin));
        if let Err(e) = self.propagate(&mut chain, positions, seeds_changed).await {
            error!("Derived state refresh at {} failed: {}", origin, e);
            return;
        }
        if chain.has_changes() {
            chain.commit_if_current(self).await;
        }
    }

    /// Replace a cached chunk wholesale (authoritative snapshot).
    pub async fn replace_chunk(&self, index: ChunkIndex, chunk: Chunk) {
        let incoming = declaring_tiles(&chunk, index);
        let previous = self.loader.insert(index, chunk).await;

        let mut table = self.dependencies.write().await;
        if let Some(previous) = previous {
            for (position, tile) in declaring_tiles(&previous, index) {
                table.remove_dependencies_of(&tile, position);
            }
        }
        for (position, tile) in &incoming {
            if let Err(e) = table.add_dependencies_of(tile, *position) {
                warn!("Skipped dependencies of {} at {}: {}", tile.kind().name(), position, e);
            }
        }
        debug!("Replaced chunk {:?}", index);
    }

    /// Drop a chunk from the cache, removing its dependency contributions.
    pub async fn unload_chunk(&self, index: ChunkIndex, save_changes: bool) -> Result<(), MapError> {
        if self.loader.is_cached(index).await {
            let declaring = self.loader.read(index, |chunk| declaring_tiles(chunk, index)).await;
            let mut table = self.dependencies.write().await;
            for (position, tile) in declaring {
                table.remove_dependencies_of(&tile, position);
            }
        }
        self.loader.unload(index, save_changes).await?;
        Ok(())
    }

    /// Save changed chunks and map metadata.
    pub async fn save_changes(&self) -> Result<(), MapError> {
        self.loader.save_changes().await?;

        let metadata = {
            let mut metadata = self.metadata.write().await;
            metadata.version = self.current_version();
            metadata.saved_at = Some(Utc::now());
            metadata.clone()
        };
        self.loader.storage().save_metadata(&metadata).await?;
        Ok(())
    }

    // =========================================================================
    // WRITES OUTSIDE TRANSACTIONS
    // =========================================================================

    /// Write a tile and keep the dependency table in step with it.
    pub(crate) async fn set_tile_info(&self, position: Point, info: TileInfo) {
        let index = ChunkIndex::of(position);
        self.ensure_chunk(index).await;
        let new_tile = info.tile.clone();
        let old = self.loader.update(index, |chunk| chunk.set(position, info)).await;
        if let Some(old) = old {
            self.swap_dependencies(position, &old.tile, &new_tile).await;
        }
    }

    /// Write a tile only if its version is still `expected`.
    pub(crate) async fn set_tile_info_if(&self, position: Point, expected: u64, info: TileInfo) -> bool {
        let index = ChunkIndex::of(position);
        self.ensure_chunk(index).await;
        let new_tile = info.tile.clone();
        let old = self
            .loader
            .update(index, |chunk| {
                if chunk.get(position).version == expected {
                    Some(chunk.set(position, info))
                } else {
                    None
                }
            })
            .await
            .flatten();
        match old {
            Some(old) => {
                self.swap_dependencies(position, &old.tile, &new_tile).await;
                true
            }
            None => false,
        }
    }

    async fn swap_dependencies(&self, position: Point, old: &Tile, new: &Tile) {
        if old.kind().dependencies() == new.kind().dependencies() {
            return;
        }
        let mut table = self.dependencies.write().await;
        table.remove_dependencies_of(old, position);
        if let Err(e) = table.add_dependencies_of(new, position) {
            warn!("Skipped dependencies of {} at {}: {}", new.kind().name(), position, e);
        }
    }

    /// Apply authoritative tile updates directly.
    pub async fn apply_tile_updates(&self, updates: &[(Point, TileInfo)]) {
        for (position, info) in updates {
            self.version.fetch_max(info.version, Ordering::SeqCst);
            self.set_tile_info(*position, info.clone()).await;
        }
    }

    pub(crate) fn publish(&self, event: &GameEvent) {
        // No subscribers is fine
        let _ = self.events.send(event.clone());
    }

    pub(crate) async fn record_commit(&self, summary: &CommitSummary, version: Option<u64>) {
        if let Some(version) = version {
            self.version.fetch_max(version, Ordering::SeqCst);
        }
        let mut metadata = self.metadata.write().await;
        for event in &summary.events {
            if let Some((id, Some(position))) = event.player_position() {
                metadata.players.insert(id, position);
            }
        }
    }

    // =========================================================================
    // AUTHORING
    // =========================================================================

    /// Design a tile: template, region and live tile.
    pub async fn place_template(&self, position: Point, tile: Tile, region: RegionId) {
        let index = ChunkIndex::of(position);
        self.ensure_chunk(index).await;
        let version = self.next_version();
        let new_tile = tile.clone();
        let old = self
            .loader
            .update(index, |chunk| {
                let old = chunk.get(position).clone();
                chunk.design(position, tile, region, version);
                old
            })
            .await;
        if let Some(old) = old {
            self.swap_dependencies(position, &old.tile, &new_tile).await;
        }
        self.refresh(vec![position], true, position).await;
    }

    /// Set the spawn area of a region.
    pub async fn set_spawn_area(&self, region: RegionId, area: Rect) {
        self.metadata.write().await.spawn_areas.insert(region, area);
    }

    /// Set the region new players spawn in.
    pub async fn set_default_region(&self, region: RegionId) {
        self.metadata.write().await.default_region = region;
    }

    // =========================================================================
    // MOVES
    // =========================================================================

    /// Move the entity at `source` to `target`.
    ///
    /// Returns the uncommitted chain. A refused move comes back cancelled
    /// with no changes.
    pub async fn move_entity(&self, source: Point, target: Point, initiator: Initiator) -> Result<TransactionChain, MapError> {
        let mut chain = TransactionChain::new(initiator);
        if self.execute_move(&mut chain, source, target, 0).await {
            self.settle(&mut chain, 0).await?;
        }
        Ok(chain)
    }

    /// Run a scheduled follow-up of the tile at `position`.
    pub async fn run_scheduled(&self, position: Point) -> Result<TransactionChain, MapError> {
        let mut chain = TransactionChain::new(Initiator::tile(position));
        let info = self.get(position).await;
        let cx = FollowUpContext {
            position,
            entity: info.tile.entity(),
            trigger: FollowUpTrigger::Scheduled,
        };
        for follow_up in info.tile.kind().on_follow_up_transaction(&cx) {
            match follow_up {
                FollowUp::Schedule { delay } => chain.schedule(position, delay),
                FollowUp::Move { from, to } => self.follow_up_move(&mut chain, from, to, 0).await?,
            }
        }
        Ok(chain)
    }

    /// One step of the attach/detach protocol. Returns false if cancelled.
    fn execute_move<'a>(
        &'a self,
        chain: &'a mut TransactionChain,
        source: Point,
        target: Point,
        depth: usize,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let step = MoveStep { source, target, depth };

            let from = chain.get(self, source).await;
            let Some(entity) = from.tile.entity().cloned() else {
                chain.cancel();
                return false;
            };
            let Some(moving) = entity.begin_move(&step) else {
                chain.cancel();
                return false;
            };

            if from.tile.kind().detach_entity(&entity, &step) == Detach::Refuse {
                debug!("{} at {} refused detach", from.tile.kind().name(), source);
                chain.cancel();
                return false;
            }
            chain.set(source, &from, from.tile.without_entity());

            let to = chain.get(self, target).await;
            if to.tile.kind().attach_entity(&moving, &step) == Attach::Refuse {
                debug!("{} at {} refused attach", to.tile.kind().name(), target);
                chain.cancel();
                return false;
            }

            if let Some(occupant) = to.tile.entity().cloned() {
                match occupant.yield_to(&moving, &step) {
                    Yield::Push => {
                        let beyond = target + step.direction();
                        if !self.execute_move(chain, target, beyond, depth + 1).await {
                            return false;
                        }
                    }
                    Yield::Collect => {
                        chain.set(target, &to, to.tile.without_entity());
                        let event = match occupant {
                            Entity::Coin { value } => GameEvent::CoinCollected {
                                at: target,
                                value,
                                by: chain.initiator(),
                            },
                            other => GameEvent::EntityRemoved { entity: other, at: target },
                        };
                        chain.emit(event);
                    }
                    Yield::Refuse => {
                        chain.cancel();
                        return false;
                    }
                }
            }

            let to = chain.get(self, target).await;
            chain.set(target, &to, to.tile.compose(moving.clone()));
            chain.emit(GameEvent::EntityMoved { entity: moving, from: source, to: target });
            true
        })
    }

    /// Propagate from the head's changes, then run follow-up hooks.
    fn settle<'a>(&'a self, chain: &'a mut TransactionChain, depth: usize) -> BoxFuture<'a, Result<(), MapError>> {
        Box::pin(async move {
            let changed = chain.head_positions();
            let visited = self.propagate(chain, changed, true).await?;
            if chain.is_cancelled() {
                return Ok(());
            }

            for position in visited {
                let info = chain.get(self, position).await;
                let cx = FollowUpContext {
                    position,
                    entity: info.tile.entity(),
                    trigger: FollowUpTrigger::Settled { depth },
                };
                for follow_up in info.tile.kind().on_follow_up_transaction(&cx) {
                    match follow_up {
                        FollowUp::Schedule { delay } => chain.schedule(position, delay),
                        FollowUp::Move { .. } if depth >= self.config.max_follow_up_depth => {
                            warn!("Follow-up at {} dropped at depth {}", position, depth);
                        }
                        FollowUp::Move { from, to } => {
                            self.follow_up_move(chain, from, to, depth + 1).await?;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Run a move in a fresh layer; the layer is dropped if it cancels.
    async fn follow_up_move(&self, chain: &mut TransactionChain, from: Point, to: Point, depth: usize) -> Result<(), MapError> {
        if !chain.push_layer() {
            return Ok(());
        }
        if self.execute_move(chain, from, to, 0).await {
            self.settle(chain, depth).await
        } else {
            debug!("Follow-up move {} -> {} cancelled", from, to);
            chain.pop_layer();
            Ok(())
        }
    }

    /// Worklist propagation of derived state.
    ///
    /// Returns every visited position. With `seeds_changed`, the initial
    /// positions count as changed on their first visit.
    async fn propagate(
        &self,
        chain: &mut TransactionChain,
        initial: Vec<Point>,
        seeds_changed: bool,
    ) -> Result<Vec<Point>, DependencyError> {
        let mut seeds: BTreeSet<Point> = if seeds_changed {
            initial.iter().copied().collect()
        } else {
            BTreeSet::new()
        };
        let mut walk = DependencyWalk::new(initial, self.config.propagation_budget);

        loop {
            let next = {
                let table = self.dependencies.read().await;
                walk.next(&table)?
            };
            let Some(position) = next else {
                break;
            };

            let visit = if chain.is_cancelled() {
                Visit::Terminate
            } else {
                let changed = self.revisit(chain, position).await;
                if changed || seeds.remove(&position) {
                    Visit::Changed
                } else {
                    Visit::Unchanged
                }
            };

            let table = self.dependencies.read().await;
            walk.report(position, visit, &table);
        }

        Ok(walk.visited().to_vec())
    }

    /// Run the move-completed hook at `position`. Returns true if it wrote.
    async fn revisit(&self, chain: &mut TransactionChain, position: Point) -> bool {
        let info = chain.get(self, position).await;

        let mut inputs = BTreeMap::new();
        for dependency in info.tile.kind().dependencies() {
            let at = dependency.resolve(position);
            inputs.insert(at, chain.get(self, at).await.tile);
        }

        let cx = CompletionContext {
            position,
            entity: info.tile.entity(),
            inputs: &inputs,
        };
        let Some(Completion { kind, events }) = info.tile.kind().on_entity_move_completed(&cx) else {
            return false;
        };

        let changed = chain.set(position, &info, info.tile.with_kind(kind));
        for event in events {
            chain.emit(event);
        }
        changed
    }

    // =========================================================================
    // SPAWN / DESPAWN / RESET
    // =========================================================================

    /// Place `entity` on the first candidate that accepts it.
    ///
    /// Returns the chosen position and the uncommitted chain.
    pub async fn spawn(
        &self,
        entity: Entity,
        candidates: impl IntoIterator<Item = Point>,
        initiator: Initiator,
    ) -> Result<Option<(Point, TransactionChain)>, MapError> {
        for position in candidates {
            let info = self.get(position).await;
            if info.tile.is_occupied() {
                continue;
            }
            let step = MoveStep { source: position, target: position, depth: 0 };
            if info.tile.kind().attach_entity(&entity, &step) == Attach::Refuse {
                continue;
            }

            let mut chain = TransactionChain::new(initiator);
            chain.set(position, &info, info.tile.compose(entity.clone()));
            chain.emit(GameEvent::EntitySpawned { entity, at: position });
            self.settle(&mut chain, 0).await?;
            return Ok(Some((position, chain)));
        }
        Ok(None)
    }

    /// Take a player's entity off the map. The last position is remembered.
    pub async fn despawn(&self, position: Point, player: PlayerId) -> Result<TransactionChain, MapError> {
        let mut chain = TransactionChain::new(Initiator::player(player, position));
        let info = self.get(position).await;
        match info.tile.entity() {
            Some(entity) if entity.player_id() == Some(player) => {
                let entity = entity.clone();
                chain.set(position, &info, info.tile.without_entity());
                chain.emit(GameEvent::EntityRemoved { entity, at: position });
                self.settle(&mut chain, 0).await?;
            }
            _ => chain.cancel(),
        }
        Ok(chain)
    }

    /// Restore every cached tile of `region` to its template.
    ///
    /// Players keep standing where they are.
    pub async fn reset_region(&self, region: RegionId) -> Result<TransactionChain, MapError> {
        let mut chain = TransactionChain::new(Initiator::system(Point::ZERO));
        let mut designed = Vec::new();
        for index in self.loader.cached_indices().await {
            let slots = self
                .loader
                .read(index, |chunk| {
                    chunk
                        .metadata_slots(index)
                        .filter(|(_, metadata)| metadata.region == region && !metadata.is_empty())
                        .map(|(position, metadata)| (position, metadata.template.clone()))
                        .collect::<Vec<_>>()
                })
                .await;
            designed.extend(slots);
        }

        let mut restored = 0;
        for (position, template) in designed {
            let info = chain.get(self, position).await;
            let tile = match info.tile.entity() {
                Some(player @ Entity::Player { .. }) => template.without_entity().compose(player.clone()),
                _ => template,
            };
            if chain.set(position, &info, tile) {
                restored += 1;
            }
        }

        chain.emit(GameEvent::RegionReset { region, tiles: restored });
        self.settle(&mut chain, 0).await?;
        info!("Reset region {} ({} tiles)", region, restored);
        Ok(chain)
    }
}

/// Tiles in `chunk` that declare dependencies.
fn declaring_tiles(chunk: &Chunk, index: ChunkIndex) -> Vec<(Point, Tile)> {
    chunk
        .tiles(index)
        .filter(|(_, info)| !info.tile.kind().dependencies().is_empty())
        .map(|(position, info)| (position, info.tile.clone()))
        .collect()
}
