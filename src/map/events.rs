//! Game Events
//!
//! Domain events emitted by transactions and flushed to observers on
//! commit. Presentation layers consume this stream; the engine never reads
//! it back.

use serde::{Serialize, Deserialize};

use crate::core::point::Point;
use crate::map::tile::{Entity, PlayerId};

/// Who started a transaction chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// A player's move request.
    Player(PlayerId),
    /// A tile's deferred follow-up.
    Tile,
    /// The engine itself (chunk loads, resets, spawns).
    System,
}

/// Initiator tag shared by every transaction in a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    /// Who.
    pub actor: Actor,
    /// Originating position.
    pub origin: Point,
}

impl Initiator {
    /// Chain started by a player at `origin`.
    pub fn player(id: PlayerId, origin: Point) -> Self {
        Self { actor: Actor::Player(id), origin }
    }

    /// Chain started by the tile at `origin`.
    pub fn tile(origin: Point) -> Self {
        Self { actor: Actor::Tile, origin }
    }

    /// Chain started by the engine.
    pub fn system(origin: Point) -> Self {
        Self { actor: Actor::System, origin }
    }
}

/// Game event data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEvent {
    /// An entity moved one step (or was carried by a follow-up).
    EntityMoved {
        entity: Entity,
        from: Point,
        to: Point,
    },

    /// An entity appeared on the map.
    EntitySpawned {
        entity: Entity,
        at: Point,
    },

    /// An entity was taken off the map.
    EntityRemoved {
        entity: Entity,
        at: Point,
    },

    /// A coin was picked up.
    CoinCollected {
        at: Point,
        value: u32,
        by: Initiator,
    },

    /// Button state flipped.
    ButtonToggled {
        position: Point,
        pressed: bool,
    },

    /// Gate state flipped.
    GateToggled {
        position: Point,
        open: bool,
    },

    /// A region was restored to its designed state.
    RegionReset {
        region: u32,
        tiles: usize,
    },
}

impl GameEvent {
    /// Player whose entity this event is about, with its new position.
    ///
    /// Used to keep last-known player positions current.
    pub fn player_position(&self) -> Option<(PlayerId, Option<Point>)> {
        match self {
            GameEvent::EntityMoved { entity, to, .. } => entity.player_id().map(|id| (id, Some(*to))),
            GameEvent::EntitySpawned { entity, at } => entity.player_id().map(|id| (id, Some(*at))),
            GameEvent::EntityRemoved { entity, .. } => entity.player_id().map(|id| (id, None)),
            _ => None,
        }
    }
}
