//! Utility tracers.

use super::Tracer;
use crate::cell::CellPtr;
use crate::heap::Nursery;

/// Counts edges without changing them.
#[derive(Debug, Default)]
pub struct CountingTracer {
    /// Number of cell edges seen.
    pub cell_edges: usize,
}

impl CountingTracer {
    /// Create a new counting tracer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for CountingTracer {
    fn on_cell_edge(&mut self, _cell: &mut CellPtr) {
        self.cell_edges += 1;
    }
}

/// Collects edges that still point into the nursery. Used to verify a
/// minor collection left nothing behind.
pub struct NurseryEdgeChecker<'a> {
    nursery: &'a Nursery,
    /// Offending targets.
    pub stale: Vec<CellPtr>,
}

impl<'a> NurseryEdgeChecker<'a> {
    /// Check edges against `nursery`.
    pub fn new(nursery: &'a Nursery) -> Self {
        Self {
            nursery,
            stale: Vec::new(),
        }
    }

    /// Whether no stale edge was found.
    pub fn is_clean(&self) -> bool {
        self.stale.is_empty()
    }
}

impl Tracer for NurseryEdgeChecker<'_> {
    fn on_cell_edge(&mut self, cell: &mut CellPtr) {
        if self.nursery.is_inside(cell.addr()) {
            self.stale.push(*cell);
        }
    }
}
