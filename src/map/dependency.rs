//! Tile Dependencies
//!
//! Directed graph between positions: an edge `dependent -> target` means
//! the dependent's derived state must be recomputed whenever the target
//! changes. Both directions are indexed.
//!
//! [`DependencyWalk`] is the propagation worklist. The caller drives it,
//! which keeps every suspension point in the map orchestrator.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::point::Point;
use crate::map::tile::{Tile, TileBehavior};
use crate::map::tiles::TileKind;

/// Dependency errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// A tile declared a dependency on its own position.
    #[error("Tile at {0} depends on itself")]
    SelfDependency(Point),

    /// The edge would close a cycle.
    #[error("Dependency {dependent} -> {target} would close a cycle")]
    Cycle {
        /// Depending position.
        dependent: Point,
        /// Position depended on.
        target: Point,
    },

    /// Propagation did not settle.
    #[error("Dependency propagation exceeded {iterations} iterations")]
    BudgetExceeded {
        /// Visits performed.
        iterations: usize,
    },
}

/// Bidirectional dependency index.
#[derive(Debug, Default)]
pub struct MapDependencyTable {
    /// dependent -> targets
    dependencies: BTreeMap<Point, BTreeSet<Point>>,
    /// target -> dependents
    dependents: BTreeMap<Point, BTreeSet<Point>>,
}

impl MapDependencyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` must be revisited when `target` changes.
    ///
    /// Rejects self edges and any edge that would close a cycle.
    pub fn add(&mut self, dependent: Point, target: Point) -> Result<(), DependencyError> {
        if dependent == target {
            return Err(DependencyError::SelfDependency(dependent));
        }
        if self.depends_on(dependent, target) {
            return Ok(());
        }
        if self.reaches(target, dependent) {
            return Err(DependencyError::Cycle { dependent, target });
        }

        self.dependencies.entry(dependent).or_default().insert(target);
        self.dependents.entry(target).or_default().insert(dependent);
        Ok(())
    }

    /// Remove an edge. Returns false if it did not exist.
    pub fn remove(&mut self, dependent: Point, target: Point) -> bool {
        let removed = remove_edge(&mut self.dependencies, dependent, target);
        if removed {
            remove_edge(&mut self.dependents, target, dependent);
        }
        removed
    }

    /// Register every dependency `tile` declares at `position`.
    ///
    /// All or nothing: on error no edge of this tile is left behind.
    pub fn add_dependencies_of(&mut self, tile: &Tile, position: Point) -> Result<(), DependencyError> {
        let mut added = Vec::new();
        for target in declared_targets(tile.kind(), position) {
            if self.depends_on(position, target) {
                continue;
            }
            if let Err(e) = self.add(position, target) {
                for target in added {
                    self.remove(position, target);
                }
                return Err(e);
            }
            added.push(target);
        }
        Ok(())
    }

    /// Remove every dependency `tile` declares at `position`.
    pub fn remove_dependencies_of(&mut self, tile: &Tile, position: Point) {
        for target in declared_targets(tile.kind(), position) {
            self.remove(position, target);
        }
    }

    /// Direct edge check.
    pub fn depends_on(&self, dependent: Point, target: Point) -> bool {
        self.dependencies
            .get(&dependent)
            .is_some_and(|targets| targets.contains(&target))
    }

    /// Positions that depend on `target`.
    pub fn dependents_of(&self, target: Point) -> impl Iterator<Item = Point> + '_ {
        self.dependents.get(&target).into_iter().flatten().copied()
    }

    /// Positions `dependent` depends on.
    pub fn dependencies_of(&self, dependent: Point) -> impl Iterator<Item = Point> + '_ {
        self.dependencies.get(&dependent).into_iter().flatten().copied()
    }

    /// Number of edges.
    pub fn len(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    /// Check if there are no edges.
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// True if `from` transitively depends on `to`.
    fn reaches(&self, from: Point, to: Point) -> bool {
        self.find_dependency(from, |p| p == to)
    }

    /// Depth-first search over the dependencies of `from` (excluding itself).
    fn find_dependency(&self, from: Point, mut hit: impl FnMut(Point) -> bool) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(p) = stack.pop() {
            for next in self.dependencies_of(p) {
                if hit(next) {
                    return true;
                }
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }
}

fn remove_edge(index: &mut BTreeMap<Point, BTreeSet<Point>>, from: Point, to: Point) -> bool {
    let Some(set) = index.get_mut(&from) else {
        return false;
    };
    let removed = set.remove(&to);
    if set.is_empty() {
        index.remove(&from);
    }
    removed
}

fn declared_targets(kind: &TileKind, position: Point) -> Vec<Point> {
    kind.dependencies()
        .into_iter()
        .map(|dependency| dependency.resolve(position))
        .collect()
}

// =============================================================================
// PROPAGATION
// =============================================================================

/// What a visit did to its position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    /// Value changed: revisit its dependents.
    Changed,
    /// Nothing to propagate from here.
    Unchanged,
    /// Abort the whole walk.
    Terminate,
}

/// Worklist propagation over a [`MapDependencyTable`].
///
/// ```ignore
/// let mut walk = DependencyWalk::new(changed, budget);
/// while let Some(p) = walk.next(&table)? {
///     let visit = revisit(p).await;
///     walk.report(p, visit, &table);
/// }
/// ```
#[derive(Debug)]
pub struct DependencyWalk {
    pending: VecDeque<Point>,
    visited: Vec<Point>,
    seen: BTreeSet<Point>,
    iterations: usize,
    budget: usize,
    terminated: bool,
}

impl DependencyWalk {
    /// Start a walk from `initial`.
    pub fn new(initial: impl IntoIterator<Item = Point>, budget: usize) -> Self {
        let mut walk = Self {
            pending: VecDeque::new(),
            visited: Vec::new(),
            seen: BTreeSet::new(),
            iterations: 0,
            budget,
            terminated: false,
        };
        for p in initial {
            walk.enqueue(p);
        }
        walk
    }

    fn enqueue(&mut self, p: Point) {
        if !self.pending.contains(&p) {
            self.pending.push_back(p);
        }
    }

    /// Next position to visit.
    ///
    /// Prefers the oldest pending position none of whose transitive
    /// dependencies are pending, so targets settle before dependents.
    pub fn next(&mut self, table: &MapDependencyTable) -> Result<Option<Point>, DependencyError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        self.iterations += 1;
        if self.iterations > self.budget {
            return Err(DependencyError::BudgetExceeded { iterations: self.iterations - 1 });
        }

        let slot = self
            .pending
            .iter()
            .position(|p| !table.find_dependency(*p, |d| self.pending.contains(&d)))
            .unwrap_or(0);
        Ok(self.pending.remove(slot))
    }

    /// Report the result of visiting `position`.
    pub fn report(&mut self, position: Point, visit: Visit, table: &MapDependencyTable) {
        if self.seen.insert(position) {
            self.visited.push(position);
        }
        match visit {
            Visit::Changed => {
                for dependent in table.dependents_of(position) {
                    self.enqueue(dependent);
                }
            }
            Visit::Unchanged => {}
            Visit::Terminate => {
                self.pending.clear();
                self.terminated = true;
            }
        }
    }

    /// Every visited position, first visit order.
    pub fn visited(&self) -> &[Point] {
        &self.visited
    }

    /// Check if a visit aborted the walk.
    pub fn was_terminated(&self) -> bool {
        self.terminated
    }

    /// Visits performed so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }
}
