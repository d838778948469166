//! Tile and Entity Values
//!
//! Immutable value types for map cells and the things standing on them.
//! A change always produces a new value (`compose`, `without_entity`,
//! `with_kind`); nothing is edited in place.
//!
//! Tiles never point back at their location or at other tiles. "Where"
//! is always a [`Point`] key into the chunk and dependency structures.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::core::point::Point;
use crate::map::events::GameEvent;
use crate::map::tiles::TileKind;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Unique player identifier (UUID as bytes).
///
/// Serialized as the UUID string so it can key JSON maps.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a random id.
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s)
            .ok()
            .map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<PlayerId> for String {
    fn from(id: PlayerId) -> String {
        id.to_uuid_string()
    }
}

impl TryFrom<String> for PlayerId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        uuid::Uuid::parse_str(&s).map(|u| Self(*u.as_bytes()))
    }
}

impl fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First group of the UUID is enough to tell players apart in logs
        let full = self.to_uuid_string();
        write!(f, "PlayerId({})", &full[..8])
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uuid_string())
    }
}

// =============================================================================
// ENTITY
// =============================================================================

/// A movable thing standing on a tile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    /// A connected (or remembered) player.
    Player {
        /// Owning player.
        id: PlayerId,
        /// Direction of the last step.
        facing: Point,
    },
    /// Pushable box.
    Crate,
    /// Collectible. Vanishes when something moves onto it.
    Coin {
        /// Points awarded on collection.
        value: u32,
    },
}

/// What an occupant does when something else wants its tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Yield {
    /// Move one step further along the incoming direction.
    Push,
    /// Disappear (collected).
    Collect,
    /// Stay put; the incoming move fails.
    Refuse,
}

impl Entity {
    /// Create a player entity facing down.
    pub fn player(id: PlayerId) -> Self {
        Entity::Player { id, facing: Point::DOWN }
    }

    /// Owning player, if this is a player entity.
    pub fn player_id(&self) -> Option<PlayerId> {
        match self {
            Entity::Player { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Begin-move hook.
    ///
    /// Returns the value that will arrive at the target, or `None` if this
    /// entity cannot be moved at all.
    pub fn begin_move(&self, step: &MoveStep) -> Option<Entity> {
        match self {
            Entity::Player { id, facing } => {
                let direction = step.direction();
                let facing = if direction.is_direction() { direction } else { *facing };
                Some(Entity::Player { id: *id, facing })
            }
            Entity::Crate => Some(Entity::Crate),
            Entity::Coin { .. } => None,
        }
    }

    /// Detach hook, asked when another entity moves onto this one's tile.
    pub fn yield_to(&self, _incoming: &Entity, step: &MoveStep) -> Yield {
        match self {
            Entity::Player { .. } => Yield::Refuse,
            // Only straight pushes; a teleport landing on a crate is blocked
            Entity::Crate if step.direction().is_direction() => Yield::Push,
            Entity::Crate => Yield::Refuse,
            Entity::Coin { .. } => Yield::Collect,
        }
    }
}

// =============================================================================
// TILE
// =============================================================================

/// Immutable map cell: a kind plus at most one entity.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tile {
    kind: TileKind,
    entity: Option<Entity>,
}

impl Tile {
    /// Create an unoccupied tile.
    pub fn new(kind: TileKind) -> Self {
        Self { kind, entity: None }
    }

    /// The void tile used for undesigned positions.
    pub fn empty() -> Self {
        Self::new(TileKind::Empty)
    }

    /// Tile kind (and its derived state).
    pub fn kind(&self) -> &TileKind {
        &self.kind
    }

    /// Current occupant.
    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }

    /// Check for an occupant.
    pub fn is_occupied(&self) -> bool {
        self.entity.is_some()
    }

    /// New tile with `entity` standing on it (replaces any occupant).
    pub fn compose(&self, entity: Entity) -> Tile {
        Tile {
            kind: self.kind.clone(),
            entity: Some(entity),
        }
    }

    /// New tile with the occupant removed.
    pub fn without_entity(&self) -> Tile {
        Tile {
            kind: self.kind.clone(),
            entity: None,
        }
    }

    /// New tile with a different kind, keeping the occupant.
    pub fn with_kind(&self, kind: TileKind) -> Tile {
        Tile {
            kind,
            entity: self.entity.clone(),
        }
    }
}

/// A tile paired with the version of the commit that last wrote it.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TileInfo {
    /// Tile value.
    pub tile: Tile,
    /// Commit version; strictly increasing per position.
    pub version: u64,
}

impl TileInfo {
    /// Create a new tile info.
    pub fn new(tile: Tile, version: u64) -> Self {
        Self { tile, version }
    }

    /// Copy with a different version.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            tile: self.tile.clone(),
            version,
        }
    }
}

/// Region identifier used by spawn areas and resets.
pub type RegionId = u32;

/// Designed state of a position: what a reset restores.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TileMetadata {
    /// Tile as designed.
    pub template: Tile,
    /// Region the position belongs to.
    pub region: RegionId,
}

impl TileMetadata {
    /// Create metadata for a designed tile.
    pub fn new(template: Tile, region: RegionId) -> Self {
        Self { template, region }
    }

    /// True if nothing was designed here.
    pub fn is_empty(&self) -> bool {
        *self == TileMetadata::default()
    }
}

// =============================================================================
// BEHAVIOR HOOKS
// =============================================================================

/// One step of a (possibly recursive) move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveStep {
    /// Where the entity comes from.
    pub source: Point,
    /// Where it goes.
    pub target: Point,
    /// Push-chain depth, 0 for the outermost move.
    pub depth: usize,
}

impl MoveStep {
    /// Offset from source to target.
    pub fn direction(&self) -> Point {
        self.target - self.source
    }
}

/// A position a tile depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRef {
    /// Fixed map position.
    Absolute {
        /// Target position.
        at: Point,
    },
    /// Offset from the declaring tile.
    Relative {
        /// Target offset.
        offset: Point,
    },
}

impl DependencyRef {
    /// Resolve against the declaring tile's position.
    pub fn resolve(self, position: Point) -> Point {
        match self {
            DependencyRef::Absolute { at } => at,
            DependencyRef::Relative { offset } => position + offset,
        }
    }
}

/// Tile answer to an incoming entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attach {
    /// Take it (displacing any occupant first).
    Accept,
    /// Cancel the transaction.
    Refuse,
}

/// Tile answer to its occupant leaving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detach {
    /// Strip the occupant.
    Release,
    /// Cancel the transaction.
    Refuse,
}

/// Input to the move-completed hook.
pub struct CompletionContext<'a> {
    /// Position of the tile being revisited.
    pub position: Point,
    /// Its current occupant.
    pub entity: Option<&'a Entity>,
    /// Current tiles at the declared dependency positions.
    pub inputs: &'a BTreeMap<Point, Tile>,
}

impl CompletionContext<'_> {
    /// Tile at a resolved dependency position.
    pub fn input(&self, position: Point) -> Option<&Tile> {
        self.inputs.get(&position)
    }
}

/// Derived-state update produced by the move-completed hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Replacement kind; the occupant is kept.
    pub kind: TileKind,
    /// Events describing the change.
    pub events: Vec<GameEvent>,
}

/// Why a follow-up hook runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowUpTrigger {
    /// After a move chain settled. `depth` counts nested follow-ups.
    Settled {
        /// Nesting level, 0 for the first follow-up pass of a chain.
        depth: usize,
    },
    /// A previously scheduled follow-up came due.
    Scheduled,
}

/// Input to the follow-up hook.
pub struct FollowUpContext<'a> {
    /// Position of the tile.
    pub position: Point,
    /// Its current occupant.
    pub entity: Option<&'a Entity>,
    /// What caused this call.
    pub trigger: FollowUpTrigger,
}

/// Work requested by the follow-up hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FollowUp {
    /// Run a new move in a fresh transaction layered on the chain.
    Move {
        /// Source position.
        from: Point,
        /// Target position.
        to: Point,
    },
    /// Call this tile's follow-up hook again after `delay`.
    Schedule {
        /// Delay from commit.
        delay: Duration,
    },
}

/// The four-hook protocol every tile variant implements.
///
/// Hooks are pure: they look at values and answer with values. The map
/// orchestrator turns the answers into transaction writes and moves, so a
/// hook can never cancel from the wrong phase or start a move outside the
/// follow-up phase.
pub trait TileBehavior {
    /// Positions whose changes must revisit this tile.
    fn dependencies(&self) -> Vec<DependencyRef> {
        Vec::new()
    }

    /// Called on the target tile of a move.
    fn attach_entity(&self, _incoming: &Entity, _step: &MoveStep) -> Attach {
        Attach::Accept
    }

    /// Called on the source tile of a move.
    fn detach_entity(&self, _leaving: &Entity, _step: &MoveStep) -> Detach {
        Detach::Release
    }

    /// Recompute derived state once a move chain has settled.
    fn on_entity_move_completed(&self, _cx: &CompletionContext<'_>) -> Option<Completion> {
        None
    }

    /// Request follow-up work after the chain settled.
    fn on_follow_up_transaction(&self, _cx: &FollowUpContext<'_>) -> Vec<FollowUp> {
        Vec::new()
    }
}
