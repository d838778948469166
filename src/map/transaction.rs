//! Transactions
//!
//! A transaction records tentative tile writes and emitted events. A chain
//! stacks transactions: follow-up moves run in a fresh layer on top of the
//! move that triggered them. Reads walk the chain newest to oldest and fall
//! through to the map; commit applies it oldest to newest.
//!
//! Only the head of a chain is writable. Layers below it are sealed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::core::point::Point;
use crate::map::chunk::ChunkIndex;
use crate::map::events::{GameEvent, Initiator};
use crate::map::storage::ChunkStorage;
use crate::map::tile::{Tile, TileInfo};
use crate::map::world::Map;

/// A position together with the version the reader saw there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionedPoint {
    /// Map position.
    pub position: Point,
    /// Tile version at read time.
    pub version: u64,
}

impl VersionedPoint {
    /// Create a versioned point.
    pub fn new(position: Point, version: u64) -> Self {
        Self { position, version }
    }
}

/// Transaction lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepts writes.
    Open,
    /// Superseded by a newer layer; read-only.
    Sealed,
    /// Refused by a tile; permanently empty.
    Cancelled,
}

/// A follow-up hook call requested for later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledFollowUp {
    /// Tile to call back.
    pub position: Point,
    /// Delay from commit.
    pub delay: Duration,
}

/// One layer of tentative changes.
#[derive(Debug)]
pub struct Transaction {
    /// Pending writes. The stored version is the base version the write
    /// was made against; commit replaces it.
    changes: BTreeMap<Point, TileInfo>,
    /// Tile seen at each position before this layer first wrote it.
    bases: BTreeMap<Point, Tile>,
    events: Vec<GameEvent>,
    state: TransactionState,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    /// Create an open transaction.
    pub fn new() -> Self {
        Self {
            changes: BTreeMap::new(),
            bases: BTreeMap::new(),
            events: Vec::new(),
            state: TransactionState::Open,
        }
    }

    /// Record a write.
    ///
    /// Returns false (and records nothing) if the transaction is not open
    /// or `tile` equals the old value. Writing a position back to the tile
    /// it held before this layer drops the recorded write.
    pub fn set(&mut self, position: Point, old: &TileInfo, tile: Tile) -> bool {
        if self.state != TransactionState::Open || old.tile == tile {
            return false;
        }
        let base = self.bases.entry(position).or_insert_with(|| old.tile.clone());
        if *base == tile {
            self.bases.remove(&position);
            self.changes.remove(&position);
        } else {
            self.changes.insert(position, TileInfo::new(tile, old.version));
        }
        true
    }

    /// Record an event. Ignored unless open.
    pub fn emit(&mut self, event: GameEvent) {
        if self.state == TransactionState::Open {
            self.events.push(event);
        }
    }

    /// Discard everything and refuse further writes.
    pub fn cancel(&mut self) {
        self.changes.clear();
        self.bases.clear();
        self.events.clear();
        self.state = TransactionState::Cancelled;
    }

    fn seal(&mut self) {
        if self.state == TransactionState::Open {
            self.state = TransactionState::Sealed;
        }
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Check for cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.state == TransactionState::Cancelled
    }

    /// Recorded write at `position`.
    pub fn change(&self, position: Point) -> Option<&TileInfo> {
        self.changes.get(&position)
    }

    /// Every recorded write.
    pub fn changes(&self) -> &BTreeMap<Point, TileInfo> {
        &self.changes
    }

    /// Recorded events in emission order.
    pub fn events(&self) -> &[GameEvent] {
        &self.events
    }
}

// =============================================================================
// CHAIN
// =============================================================================

/// What a commit wrote.
#[derive(Clone, Debug, Default)]
pub struct CommitSummary {
    /// Final value per position (newest layer wins).
    pub changes: BTreeMap<Point, TileInfo>,
    /// Events of every layer, oldest layer first.
    pub events: Vec<GameEvent>,
    /// Follow-ups to run later.
    pub scheduled: Vec<ScheduledFollowUp>,
}

impl CommitSummary {
    /// Written tiles as a flat list.
    pub fn updates(&self) -> Vec<(Point, TileInfo)> {
        self.changes.iter().map(|(p, info)| (*p, info.clone())).collect()
    }

    /// Chunks containing a written tile.
    pub fn chunks(&self) -> BTreeSet<ChunkIndex> {
        self.changes.keys().map(|p| ChunkIndex::of(*p)).collect()
    }

    /// Check if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Stack of transactions sharing one initiator.
#[derive(Debug)]
pub struct TransactionChain {
    layers: Vec<Transaction>,
    scheduled: Vec<ScheduledFollowUp>,
    initiator: Initiator,
}

impl TransactionChain {
    /// Chain with a single open transaction.
    pub fn new(initiator: Initiator) -> Self {
        Self {
            layers: vec![Transaction::new()],
            scheduled: Vec::new(),
            initiator,
        }
    }

    /// Who started this chain.
    pub fn initiator(&self) -> Initiator {
        self.initiator
    }

    fn head(&self) -> &Transaction {
        // A chain always has its base layer
        &self.layers[self.layers.len() - 1]
    }

    fn head_mut(&mut self) -> &mut Transaction {
        let last = self.layers.len() - 1;
        &mut self.layers[last]
    }

    /// Record a write in the head transaction.
    pub fn set(&mut self, position: Point, old: &TileInfo, tile: Tile) -> bool {
        self.head_mut().set(position, old, tile)
    }

    /// Record an event in the head transaction.
    pub fn emit(&mut self, event: GameEvent) {
        self.head_mut().emit(event);
    }

    /// Cancel the head transaction.
    pub fn cancel(&mut self) {
        if self.layers.len() == 1 {
            self.scheduled.clear();
        }
        self.head_mut().cancel();
    }

    /// Check if the head transaction was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.head().is_cancelled()
    }

    /// Request a later follow-up call for `position`.
    pub fn schedule(&mut self, position: Point, delay: Duration) {
        if !self.is_cancelled() {
            self.scheduled.push(ScheduledFollowUp { position, delay });
        }
    }

    /// Seal the head and open a new layer on top. Refused on a cancelled head.
    pub fn push_layer(&mut self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.head_mut().seal();
        self.layers.push(Transaction::new());
        true
    }

    /// Drop the head layer. The base layer is never removed.
    pub fn pop_layer(&mut self) -> Option<Transaction> {
        if self.layers.len() > 1 {
            self.layers.pop()
        } else {
            None
        }
    }

    /// Number of layers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Every layer, oldest first.
    pub fn layers(&self) -> &[Transaction] {
        &self.layers
    }

    /// Newest recorded write at `position`, if any layer touched it.
    pub fn peek(&self, position: Point) -> Option<&TileInfo> {
        self.layers.iter().rev().find_map(|layer| layer.change(position))
    }

    /// Read through the chain, falling back to the map.
    pub async fn get<S: ChunkStorage>(&self, map: &Map<S>, position: Point) -> TileInfo {
        match self.peek(position) {
            Some(info) => info.clone(),
            None => map.get(position).await,
        }
    }

    /// Positions written by the head transaction.
    pub fn head_positions(&self) -> Vec<Point> {
        self.head().changes.keys().copied().collect()
    }

    /// Check if committing would change any tile.
    pub fn has_changes(&self) -> bool {
        !self.net_changes().is_empty()
    }

    /// Final value of every position that ends up different from the tile
    /// it held before the chain.
    fn net_changes(&self) -> BTreeMap<Point, TileInfo> {
        let mut bases: BTreeMap<Point, &Tile> = BTreeMap::new();
        let mut finals: BTreeMap<Point, &TileInfo> = BTreeMap::new();
        for layer in &self.layers {
            for (position, info) in &layer.changes {
                if let Some(base) = layer.bases.get(position) {
                    bases.entry(*position).or_insert(base);
                }
                finals.insert(*position, info);
            }
        }
        finals
            .into_iter()
            .filter(|(position, info)| bases.get(position).map_or(true, |base| **base != info.tile))
            .map(|(position, info)| (position, info.clone()))
            .collect()
    }

    /// Every written position with the version it was read at.
    ///
    /// This is what a replica compares to detect staleness.
    pub fn affected_points(&self) -> Vec<VersionedPoint> {
        let mut affected: BTreeMap<Point, u64> = BTreeMap::new();
        for layer in &self.layers {
            for (position, info) in &layer.changes {
                // The oldest layer holds the version read from the map
                affected.entry(*position).or_insert(info.version);
            }
        }
        affected
            .into_iter()
            .map(|(position, version)| VersionedPoint::new(position, version))
            .collect()
    }

    /// Events of every layer, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &GameEvent> {
        self.layers.iter().flat_map(|layer| layer.events.iter())
    }

    /// Follow-ups requested so far.
    pub fn scheduled(&self) -> &[ScheduledFollowUp] {
        &self.scheduled
    }

    /// Apply every layer to the map, oldest first, and publish events.
    ///
    /// With `Some(version)` every written tile gets that version; with
    /// `None` the recorded versions are kept.
    pub async fn commit<S: ChunkStorage>(self, map: &Map<S>, version: Option<u64>) -> CommitSummary {
        let changes = self.net_changes();
        let mut summary = CommitSummary {
            scheduled: self.scheduled,
            ..Default::default()
        };

        for (position, info) in changes {
            let info = match version {
                Some(v) => info.with_version(v),
                None => info,
            };
            map.set_tile_info(position, info.clone()).await;
            summary.changes.insert(position, info);
        }
        for event in self.layers.into_iter().flat_map(|layer| layer.events) {
            map.publish(&event);
            summary.events.push(event);
        }

        map.record_commit(&summary, version).await;
        summary
    }

    /// Apply the chain keeping recorded versions, skipping every position
    /// whose map version moved past the one the chain read.
    ///
    /// For derived state recomputed outside a versioned commit, which must
    /// never overwrite a newer commit.
    pub async fn commit_if_current<S: ChunkStorage>(self, map: &Map<S>) -> CommitSummary {
        let base: BTreeMap<Point, u64> = self
            .affected_points()
            .into_iter()
            .map(|point| (point.position, point.version))
            .collect();
        let changes = self.net_changes();
        let mut summary = CommitSummary {
            scheduled: self.scheduled,
            ..Default::default()
        };

        for (position, info) in changes {
            let expected = base.get(&position).copied().unwrap_or(info.version);
            if map.set_tile_info_if(position, expected, info.clone()).await {
                summary.changes.insert(position, info);
            } else {
                debug!("Kept newer tile at {} over recomputed state", position);
            }
        }
        for event in self.layers.into_iter().flat_map(|layer| layer.events) {
            map.publish(&event);
            summary.events.push(event);
        }

        map.record_commit(&summary, None).await;
        summary
    }
}
