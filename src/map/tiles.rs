//! Tile Catalog
//!
//! The closed set of tile variants. Each variant is its own type
//! implementing [`TileBehavior`]; [`TileKind`] dispatches to them.

use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::core::point::Point;
use crate::map::events::GameEvent;
use crate::map::tile::{
    Attach, Completion, CompletionContext, DependencyRef, Detach, Entity, FollowUp,
    FollowUpContext, FollowUpTrigger, MoveStep, TileBehavior,
};

/// Default conveyor delay.
pub const CONVEYOR_DELAY: Duration = Duration::from_millis(500);

/// Every tile variant.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileKind {
    /// Undesigned void. Nothing can stand here.
    #[default]
    Empty,
    /// Plain walkable floor.
    Path,
    /// Solid wall.
    Wall,
    /// Pressure button.
    Button(Button),
    /// Gate driven by buttons.
    Gate(Gate),
    /// Instant teleporter.
    Teleporter(Teleporter),
    /// Conveyor belt.
    Conveyor(Conveyor),
}

impl TileKind {
    fn behavior(&self) -> &dyn TileBehavior {
        match self {
            TileKind::Empty => &Void,
            TileKind::Path => &Floor,
            TileKind::Wall => &Solid,
            TileKind::Button(b) => b,
            TileKind::Gate(g) => g,
            TileKind::Teleporter(t) => t,
            TileKind::Conveyor(c) => c,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            TileKind::Empty => "empty",
            TileKind::Path => "path",
            TileKind::Wall => "wall",
            TileKind::Button(_) => "button",
            TileKind::Gate(_) => "gate",
            TileKind::Teleporter(_) => "teleporter",
            TileKind::Conveyor(_) => "conveyor",
        }
    }
}

impl TileBehavior for TileKind {
    fn dependencies(&self) -> Vec<DependencyRef> {
        self.behavior().dependencies()
    }

    fn attach_entity(&self, incoming: &Entity, step: &MoveStep) -> Attach {
        self.behavior().attach_entity(incoming, step)
    }

    fn detach_entity(&self, leaving: &Entity, step: &MoveStep) -> Detach {
        self.behavior().detach_entity(leaving, step)
    }

    fn on_entity_move_completed(&self, cx: &CompletionContext<'_>) -> Option<Completion> {
        self.behavior().on_entity_move_completed(cx)
    }

    fn on_follow_up_transaction(&self, cx: &FollowUpContext<'_>) -> Vec<FollowUp> {
        self.behavior().on_follow_up_transaction(cx)
    }
}

// =============================================================================
// STATIC TILES
// =============================================================================

struct Void;

impl TileBehavior for Void {
    fn attach_entity(&self, _incoming: &Entity, _step: &MoveStep) -> Attach {
        Attach::Refuse
    }
}

struct Floor;

impl TileBehavior for Floor {}

struct Solid;

impl TileBehavior for Solid {
    fn attach_entity(&self, _incoming: &Entity, _step: &MoveStep) -> Attach {
        Attach::Refuse
    }
}

// =============================================================================
// BUTTON
// =============================================================================

/// Pressed while anything stands on it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Derived: occupant present.
    pub pressed: bool,
}

impl TileBehavior for Button {
    fn on_entity_move_completed(&self, cx: &CompletionContext<'_>) -> Option<Completion> {
        let pressed = cx.entity.is_some();
        if pressed == self.pressed {
            return None;
        }
        Some(Completion {
            kind: TileKind::Button(Button { pressed }),
            events: vec![GameEvent::ButtonToggled { position: cx.position, pressed }],
        })
    }
}

// =============================================================================
// GATE
// =============================================================================

/// Open while every switch it depends on is active: a pressed button or
/// another open gate (relays).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    /// Derived: passable.
    pub open: bool,
    /// Buttons controlling this gate.
    pub switches: Vec<DependencyRef>,
}

impl Gate {
    /// Closed gate controlled by `switches`.
    pub fn new(switches: Vec<DependencyRef>) -> Self {
        Self { open: false, switches }
    }
}

impl TileBehavior for Gate {
    fn dependencies(&self) -> Vec<DependencyRef> {
        self.switches.clone()
    }

    fn attach_entity(&self, _incoming: &Entity, _step: &MoveStep) -> Attach {
        if self.open { Attach::Accept } else { Attach::Refuse }
    }

    fn on_entity_move_completed(&self, cx: &CompletionContext<'_>) -> Option<Completion> {
        let powered = !self.switches.is_empty()
            && self.switches.iter().all(|switch| {
                let at = switch.resolve(cx.position);
                matches!(
                    cx.input(at).map(|tile| tile.kind()),
                    Some(TileKind::Button(Button { pressed: true })) | Some(TileKind::Gate(Gate { open: true, .. }))
                )
            });

        // Never close on top of an occupant
        let open = powered || (self.open && cx.entity.is_some());
        if open == self.open {
            return None;
        }
        Some(Completion {
            kind: TileKind::Gate(Gate { open, switches: self.switches.clone() }),
            events: vec![GameEvent::GateToggled { position: cx.position, open }],
        })
    }
}

// =============================================================================
// TELEPORTER
// =============================================================================

/// Sends whatever arrives to `destination`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teleporter {
    /// Absolute destination.
    pub destination: Point,
}

impl TileBehavior for Teleporter {
    fn on_follow_up_transaction(&self, cx: &FollowUpContext<'_>) -> Vec<FollowUp> {
        // Only the first follow-up pass teleports, so two linked
        // teleporters cannot bounce an entity back and forth.
        match (cx.trigger, cx.entity) {
            (FollowUpTrigger::Settled { depth: 0 }, Some(_)) => vec![FollowUp::Move {
                from: cx.position,
                to: self.destination,
            }],
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// CONVEYOR
// =============================================================================

/// Pushes its occupant one step along `direction` after `delay_ms`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conveyor {
    /// Unit push direction.
    pub direction: Point,
    /// Delay before the push.
    pub delay_ms: u64,
}

impl Conveyor {
    /// Conveyor with the default delay.
    pub fn new(direction: Point) -> Self {
        Self {
            direction,
            delay_ms: CONVEYOR_DELAY.as_millis() as u64,
        }
    }
}

impl TileBehavior for Conveyor {
    fn on_follow_up_transaction(&self, cx: &FollowUpContext<'_>) -> Vec<FollowUp> {
        if cx.entity.is_none() {
            return Vec::new();
        }
        match cx.trigger {
            FollowUpTrigger::Settled { .. } => vec![FollowUp::Schedule {
                delay: Duration::from_millis(self.delay_ms),
            }],
            FollowUpTrigger::Scheduled => vec![FollowUp::Move {
                from: cx.position,
                to: cx.position + self.direction,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::map::tile::{PlayerId, Tile};

    fn step() -> MoveStep {
        MoveStep { source: Point::new(0, 0), target: Point::new(1, 0), depth: 0 }
    }

    #[test]
    fn test_static_tiles() {
        let crate_ = Entity::Crate;
        assert_eq!(TileKind::Path.attach_entity(&crate_, &step()), Attach::Accept);
        assert_eq!(TileKind::Wall.attach_entity(&crate_, &step()), Attach::Refuse);
        assert_eq!(TileKind::Empty.attach_entity(&crate_, &step()), Attach::Refuse);
    }

    #[test]
    fn test_button_follows_occupant() {
        let inputs = BTreeMap::new();
        let player = Entity::player(PlayerId::new([1; 16]));
        let released = TileKind::Button(Button::default());

        let cx = CompletionContext { position: Point::new(1, 1), entity: Some(&player), inputs: &inputs };
        let completion = released.on_entity_move_completed(&cx).unwrap();
        assert_eq!(completion.kind, TileKind::Button(Button { pressed: true }));
        assert_eq!(completion.events, vec![GameEvent::ButtonToggled { position: Point::new(1, 1), pressed: true }]);

        // No change, no completion
        let cx = CompletionContext { position: Point::new(1, 1), entity: None, inputs: &inputs };
        assert!(released.on_entity_move_completed(&cx).is_none());
    }

    #[test]
    fn test_gate_opens_with_all_switches() {
        let gate = Gate::new(vec![
            DependencyRef::Relative { offset: Point::UP },
            DependencyRef::Absolute { at: Point::new(5, 5) },
        ]);
        let here = Point::new(1, 2);
        let pressed = Tile::new(TileKind::Button(Button { pressed: true }));
        let released = Tile::new(TileKind::Button(Button { pressed: false }));

        let mut inputs = BTreeMap::new();
        inputs.insert(Point::new(1, 1), pressed.clone());
        inputs.insert(Point::new(5, 5), released);
        let cx = CompletionContext { position: here, entity: None, inputs: &inputs };
        assert!(gate.on_entity_move_completed(&cx).is_none());

        inputs.insert(Point::new(5, 5), pressed);
        let cx = CompletionContext { position: here, entity: None, inputs: &inputs };
        let completion = gate.on_entity_move_completed(&cx).unwrap();
        assert!(matches!(completion.kind, TileKind::Gate(Gate { open: true, .. })));
    }

    #[test]
    fn test_gate_stays_open_while_occupied() {
        let gate = Gate { open: true, switches: vec![DependencyRef::Relative { offset: Point::UP }] };
        let inputs = BTreeMap::new();
        let occupant = Entity::Crate;
        let cx = CompletionContext { position: Point::new(0, 1), entity: Some(&occupant), inputs: &inputs };
        assert!(gate.on_entity_move_completed(&cx).is_none());

        let cx = CompletionContext { position: Point::new(0, 1), entity: None, inputs: &inputs };
        let completion = gate.on_entity_move_completed(&cx).unwrap();
        assert!(matches!(completion.kind, TileKind::Gate(Gate { open: false, .. })));
    }

    #[test]
    fn test_teleporter_only_first_pass() {
        let teleporter = Teleporter { destination: Point::new(9, 9) };
        let crate_ = Entity::Crate;
        let cx = FollowUpContext {
            position: Point::new(1, 1),
            entity: Some(&crate_),
            trigger: FollowUpTrigger::Settled { depth: 0 },
        };
        assert_eq!(
            teleporter.on_follow_up_transaction(&cx),
            vec![FollowUp::Move { from: Point::new(1, 1), to: Point::new(9, 9) }]
        );

        let cx = FollowUpContext { trigger: FollowUpTrigger::Settled { depth: 1 }, ..cx };
        assert!(teleporter.on_follow_up_transaction(&cx).is_empty());
    }

    #[test]
    fn test_conveyor_schedules_then_pushes() {
        let conveyor = Conveyor::new(Point::RIGHT);
        let crate_ = Entity::Crate;
        let settled = FollowUpContext {
            position: Point::new(2, 2),
            entity: Some(&crate_),
            trigger: FollowUpTrigger::Settled { depth: 0 },
        };
        assert_eq!(
            conveyor.on_follow_up_transaction(&settled),
            vec![FollowUp::Schedule { delay: CONVEYOR_DELAY }]
        );

        let due = FollowUpContext { trigger: FollowUpTrigger::Scheduled, ..settled };
        assert_eq!(
            conveyor.on_follow_up_transaction(&due),
            vec![FollowUp::Move { from: Point::new(2, 2), to: Point::new(3, 2) }]
        );

        let idle = FollowUpContext { entity: None, ..due };
        assert!(conveyor.on_follow_up_transaction(&idle).is_empty());
    }
}
